//! Error types for the bootstrap subsystem.
use std::time::Duration;

use thiserror::Error;

/// The errors surfaced by this crate.
///
/// Locally recoverable conditions (a single candidate failing, a single tunnel
/// attempt failing) are absorbed and retried inside the component that hit
/// them; every variant here means a retry budget was exhausted or the failure
/// was never retryable to begin with.
#[derive(Debug, Error)]
pub enum Error {
    /// No image/node pair appeared in the cluster before the search deadline.
    #[error("timed out after {0:?} waiting for a running image on a schedulable node")]
    ImageSearchTimeout(Duration),

    /// Every candidate image was tried and none could host the injector.
    #[error("no existing cluster image was able to host the bootstrap injector")]
    CandidatesExhausted,

    /// Tunnel establishment failed after its full retry budget.
    #[error("unable to establish tunnel after {attempts} attempts: {source}")]
    TunnelExhausted {
        /// How many establishment attempts were made before giving up.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<Error>,
    },

    /// `Tunnel::connect` was called on a tunnel that is already forwarding.
    #[error("tunnel is already connected")]
    TunnelAlreadyConnected,

    /// A service had no ready pod behind its label selector to forward to.
    #[error("no ready pods found backing service {0:?}")]
    NoBackingPod(String),

    /// The port-forward session did not hand back a stream for the remote port.
    #[error("port-forward stream for remote port {0} was not available")]
    MissingPortStream(u16),

    /// The injector service was created but never assigned a NodePort.
    #[error("injector service was created without a NodePort assignment")]
    MissingNodePort,

    /// A node reported a resource quantity this crate could not parse.
    #[error("invalid resource quantity {0:?}")]
    InvalidQuantity(String),

    /// Any error returned by the Kubernetes API.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Filesystem or socket errors.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
