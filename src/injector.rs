//! The bootstrap orchestrator: serial candidate trials, verification through
//! a tunnel, and teardown once the permanent registry has taken over.
//!
//! Candidates are tried strictly one at a time. Two pods racing for the same
//! name/namespace would conflict, and most clusters converge on the first or
//! second candidate anyway, so serial trial is cheaper than coordinating
//! parallel attempts and their cleanup.
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use reqwest::header::ACCEPT;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

use crate::cluster::{
    ignore_not_found, selector_string, Cluster, INJECTOR_BINARY_KEY, INJECTOR_POD,
    INJECTOR_SERVICE, PAYLOAD_LABEL,
};
use crate::error::{Error, Result};
use crate::inventory;
use crate::payload::Payload;
use crate::pod::{build_injection_pod, build_injector_service, injector_request, REGISTRY_PORT};
use crate::tunnel::{Tunnel, TunnelTarget};

/// How long a single candidate gets to start serving the seed manifests once
/// its pod exists and a tunnel is up.
const SEED_PROBE_TIMEOUT: Duration = Duration::from_secs(20);
const SEED_PROBE_INTERVAL: Duration = Duration::from_secs(1);

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.manifest.v1+json";

impl Cluster {
    /// Bootstraps the seed registry into the cluster.
    ///
    /// `tmp_dir` must hold the injector executable (named `zarf-injector`),
    /// `images_dir` the seed-image layout to deliver; `seed_image_refs` are
    /// the references the final verification step expects the injector to
    /// serve. On success the injector pod, service, and payload ConfigMaps
    /// are left in place for the permanent registry to pull from until
    /// [`stop_injection`](Cluster::stop_injection) is called; the return
    /// value is the service's assigned NodePort.
    ///
    /// A failed run can be retried as-is: every object is deleted before it
    /// is re-created, so a second invocation converges on the same end state.
    #[instrument(skip_all)]
    pub async fn start_injection(
        &self,
        tmp_dir: &Path,
        images_dir: &Path,
        seed_image_refs: &[String],
    ) -> Result<i32> {
        self.start_injection_with(tmp_dir, images_dir, || {
            self.seed_registry_ready(seed_image_refs)
        })
        .await
    }

    /// The pipeline behind [`start_injection`](Cluster::start_injection), with
    /// the per-candidate verification step injected so the orchestration can
    /// be exercised without a live port-forward.
    async fn start_injection_with<F, Fut>(
        &self,
        tmp_dir: &Path,
        images_dir: &Path,
        verify: F,
    ) -> Result<i32>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        info!("attempting to bootstrap the seed registry into the cluster");
        self.ensure_namespace().await?;

        let request = injector_request();
        let images = inventory::find_bootstrap_images(
            &self.client(),
            &request,
            self.config().image_search_deadline,
        )
        .await?;

        self.create_injector_config_map(&tmp_dir.join(INJECTOR_BINARY_KEY))
            .await?;
        let node_port = self.create_injector_service().await?;

        let payload = Payload::from_directory(images_dir, self.config().chunk_size)?;
        let config_maps = self.create_payload_config_maps(&payload).await?;

        let pods: Api<Pod> = Api::namespaced(self.client(), self.namespace());
        for candidate in inventory::candidates(&images) {
            debug!(
                image = %candidate.image,
                node = %candidate.node,
                "attempting to bootstrap with candidate"
            );

            // Clear any stale pod from a previous attempt before re-creating.
            ignore_not_found(
                pods.delete(
                    INJECTOR_POD,
                    &DeleteParams {
                        grace_period_seconds: Some(0),
                        ..Default::default()
                    },
                )
                .await,
            )?;

            let pod = build_injection_pod(
                self.namespace(),
                &candidate,
                &config_maps,
                &payload.sha256sum,
            );
            if let Err(err) = pods.create(&PostParams::default(), &pod).await {
                debug!(%err, image = %candidate.image, "injection pod creation failed, trying next candidate");
                continue;
            }

            if verify().await {
                info!(
                    image = %candidate.image,
                    node = %candidate.node,
                    node_port,
                    "seed registry is bootstrapped and serving"
                );
                return Ok(node_port);
            }
            debug!(image = %candidate.image, "injector never became ready, trying next candidate");
        }

        Err(Error::CandidatesExhausted)
    }

    /// Removes the injector pod, the payload and executable ConfigMaps, and
    /// the injector service. Objects already gone are not an error.
    #[instrument(skip_all)]
    pub async fn stop_injection(&self) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client(), self.namespace());
        ignore_not_found(pods.delete(INJECTOR_POD, &DeleteParams::default()).await)?;

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client(), self.namespace());
        let payload_selector = selector_string(&BTreeMap::from([(
            PAYLOAD_LABEL.0.to_owned(),
            PAYLOAD_LABEL.1.to_owned(),
        )]));
        config_maps
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(&payload_selector),
            )
            .await?;

        let services: Api<Service> = Api::namespaced(self.client(), self.namespace());
        ignore_not_found(
            services
                .delete(INJECTOR_SERVICE, &DeleteParams::default())
                .await,
        )?;

        info!("bootstrap injection state removed");
        Ok(())
    }

    /// Replaces and re-creates the NodePort service fronting the injector,
    /// returning the assigned NodePort.
    async fn create_injector_service(&self) -> Result<i32> {
        let services: Api<Service> = Api::namespaced(self.client(), self.namespace());
        ignore_not_found(
            services
                .delete(INJECTOR_SERVICE, &DeleteParams::default())
                .await,
        )?;
        let created = services
            .create(
                &PostParams::default(),
                &build_injector_service(self.namespace()),
            )
            .await?;
        created
            .spec
            .and_then(|spec| spec.ports)
            .and_then(|ports| ports.into_iter().next())
            .and_then(|port| port.node_port)
            .ok_or(Error::MissingNodePort)
    }

    /// Opens a tunnel to the injector service and polls it for the seed image
    /// manifests. Any failure here (tunnel exhaustion included) just fails
    /// the current candidate.
    async fn seed_registry_ready(&self, seed_image_refs: &[String]) -> bool {
        let mut tunnel = Tunnel::new(
            self.client(),
            self.namespace(),
            TunnelTarget::Service(INJECTOR_SERVICE.to_owned()),
            0,
            REGISTRY_PORT as u16,
            "",
        );
        if let Err(err) = tunnel.connect().await {
            debug!(%err, "could not open a tunnel to the injector service");
            return false;
        }
        let ready = probe_seed_manifests(&tunnel.http_endpoint(), seed_image_refs).await;
        tunnel.close().await;
        ready
    }
}

/// Polls the tunnelled registry until every seed manifest answers 200 or the
/// probe window closes. An empty ref list degrades to the bare `/v2/`
/// readiness path.
async fn probe_seed_manifests(base_url: &str, seed_image_refs: &[String]) -> bool {
    let urls: Vec<String> = if seed_image_refs.is_empty() {
        vec![format!("{}/v2/", base_url)]
    } else {
        seed_image_refs
            .iter()
            .map(|image| {
                let (name, tag) = split_image_ref(image);
                format!("{}/v2/{}/manifests/{}", base_url, name, tag)
            })
            .collect()
    };

    let http = reqwest::Client::new();
    let started = Instant::now();
    while started.elapsed() < SEED_PROBE_TIMEOUT {
        sleep(SEED_PROBE_INTERVAL).await;

        let mut all_present = true;
        for url in &urls {
            match http.get(url).header(ACCEPT, MANIFEST_ACCEPT).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    debug!(%url, status = %response.status(), "seed manifest not served yet");
                    all_present = false;
                    break;
                }
                Err(err) => {
                    debug!(%url, %err, "seed manifest probe failed");
                    all_present = false;
                    break;
                }
            }
        }
        if all_present {
            return true;
        }
    }
    false
}

/// Splits an image reference into a repository name and tag (or digest) for
/// the manifest endpoint, dropping any registry host prefix since the
/// injector only serves local names.
fn split_image_ref(image: &str) -> (&str, &str) {
    let mut name = image;
    if let Some((first, rest)) = image.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            name = rest;
        }
    }
    if let Some((repository, digest)) = name.split_once('@') {
        return (repository, digest);
    }
    match name.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (name, "latest"),
    }
}
