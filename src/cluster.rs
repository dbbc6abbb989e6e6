//! A thin client wrapper around the Kubernetes API, plus the well-known names
//! shared by every piece of bootstrap state in the cluster.
use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::error::ErrorResponse;
use tracing::debug;

use crate::error::Result;

/// Namespace holding all bootstrap state.
pub const BOOTSTRAP_NAMESPACE: &str = "zarf";

/// Fixed name of the throwaway injection pod.
pub const INJECTOR_POD: &str = "injector";

/// Name of the NodePort service fronting the injection pod.
pub const INJECTOR_SERVICE: &str = "zarf-injector";

/// Name of the ConfigMap carrying the injector executable.
pub const BINARY_CONFIGMAP: &str = "injector-binaries";

/// Key (and in-pod filename) of the injector executable.
pub const INJECTOR_BINARY_KEY: &str = "zarf-injector";

/// Label selecting the injection pod, also used by its service.
pub const APP_LABEL: (&str, &str) = ("app", "zarf-injector");

/// Label carried by every bootstrap ConfigMap so teardown can sweep them.
pub const PAYLOAD_LABEL: (&str, &str) = ("zarf-injector", "payload");

/// Label telling the in-cluster agent to leave the injection pod alone.
pub const AGENT_LABEL: (&str, &str) = ("zarf.dev/agent", "ignore");

/// Tunables for a bootstrap run. [`Config::default`] matches what a production
/// cluster wants; tests dial the pauses and deadlines down.
#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace to hold all bootstrap state.
    pub namespace: String,
    /// Upper bound on a single payload chunk, in bytes. Must stay conservatively
    /// below the API object size ceiling to leave headroom for base64 expansion.
    pub chunk_size: usize,
    /// How long the inventory will poll for a usable image before timing out.
    pub image_search_deadline: Duration,
    /// Pause between successive ConfigMap writes.
    pub control_plane_pause: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: BOOTSTRAP_NAMESPACE.to_owned(),
            chunk_size: crate::payload::DEFAULT_CHUNK_SIZE,
            image_search_deadline: Duration::from_secs(300),
            control_plane_pause: Duration::from_millis(250),
        }
    }
}

/// A connection to the target cluster scoped to the bootstrap namespace.
///
/// The orchestration entry points ([`start_injection`](Cluster::start_injection)
/// and [`stop_injection`](Cluster::stop_injection)) live in the `injector`
/// module; payload transport lives in `payload`.
#[derive(Clone)]
pub struct Cluster {
    client: kube::Client,
    config: Config,
}

impl Cluster {
    /// Connects using the usual kubeconfig/in-cluster inference and default
    /// bootstrap tunables.
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(kube::Client::try_default().await?, Config::default()))
    }

    /// Wraps an existing client with the given tunables.
    pub fn new(client: kube::Client, config: Config) -> Self {
        Self { client, config }
    }

    /// A clone of the underlying client, for callers that need raw API access
    /// (e.g. to open a [`Tunnel`](crate::Tunnel)).
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    /// The bootstrap namespace this cluster is scoped to.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the bootstrap namespace, tolerating one that already exists.
    pub async fn ensure_namespace(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.config.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/managed-by".to_owned(),
                    "zarf".to_owned(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
                debug!(namespace = %self.config.namespace, "bootstrap namespace already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Collapses a 404 from a delete into success so replace-style operations and
/// teardown stay idempotent. All other errors propagate.
pub(crate) fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Formats a label map as a `key=value,key=value` selector string.
pub(crate) fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join(",")
}
