//! Bootstraps a minimal container registry inside an airgapped Kubernetes cluster.
//!
//! An airgapped cluster can pull no new images, so the usual "deploy a registry
//! chart" path is a chicken-and-egg problem: the registry image itself cannot be
//! pulled. This crate transplants a registry into such a cluster using only
//! primitives every compliant cluster already has (Pods, ConfigMaps, Services)
//! and an image the cluster already holds:
//!
//! 1. [`inventory`] lists running pods cluster-wide and records which images are
//!    present on which schedulable nodes.
//! 2. [`payload`] archives the seed-image directory, chunks the archive to fit
//!    under the API object size ceiling, and ships the chunks (plus the injector
//!    executable) into the cluster as binary ConfigMaps.
//! 3. [`pod`] builds a throwaway pod pinned to a candidate (image, node) pair
//!    with the chunks mounted into its working directory.
//! 4. The orchestrator on [`Cluster`] tries candidates one at a time, using a
//!    [`Tunnel`] to verify that the injector is serving the seed image manifest
//!    before declaring victory.
//!
//! # Example
//! ```rust,no_run
//! use std::path::Path;
//! use zarf_bootstrap::Cluster;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), zarf_bootstrap::Error> {
//!     let cluster = Cluster::connect().await?;
//!     let node_port = cluster
//!         .start_injection(
//!             Path::new("/tmp/zarf"),
//!             Path::new("/tmp/zarf/seed-images"),
//!             &["library/registry:2.8.3".to_owned()],
//!         )
//!         .await?;
//!     println!("seed registry reachable on NodePort {}", node_port);
//!
//!     // ... hand ownership to the permanent registry, then:
//!     cluster.stop_injection().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod error;
mod injector;
pub mod inventory;
pub mod payload;
pub mod pod;
pub mod resources;
pub mod tunnel;

pub use cluster::{Cluster, Config};
pub use error::Error;
pub use tunnel::{Tunnel, TunnelTarget};
