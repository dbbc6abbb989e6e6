//! Discovery of images already present on schedulable cluster nodes.
//!
//! An airgapped cluster cannot pull anything, so the only images the injection
//! pod can run are ones some node already holds. The inventory polls the list
//! of running pods cluster-wide and records every container image against the
//! node hosting it, skipping nodes that could not actually schedule the
//! injector.
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::resources::{parse_cpu_millis, parse_memory_bytes, ResourceRequest};

/// Map of container image reference to the nodes known to host it. Every entry
/// holds at least one node; ineligible nodes are pruned during collection.
pub type ImageNodeMap = BTreeMap<String, Vec<String>>;

/// A single (image, node) pair the orchestrator can try to bootstrap with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// An image reference some node already holds.
    pub image: String,
    /// The node the injection pod will be pinned to.
    pub node: String,
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);

lazy_static! {
    // Images served from the loopback seed registry mean a prior bootstrap
    // already ran; they can never be pulled from a node's local store. The
    // pattern is not exhaustive for every possible in-cluster registry
    // address.
    static ref SEED_REGISTRY: Regex = Regex::new(r"^127\.0\.0\.1:").expect("static regex");
}

/// Lists running pods cluster-wide until at least one image is found on a node
/// that passes the allocatable-resources and taint checks, polling every two
/// seconds. Fails with [`Error::ImageSearchTimeout`] once `deadline` has
/// elapsed without a single usable image.
pub async fn find_bootstrap_images(
    client: &kube::Client,
    request: &ResourceRequest,
    deadline: Duration,
) -> Result<ImageNodeMap> {
    let pods: Api<Pod> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client.clone());
    let running = ListParams::default().fields("status.phase=Running");
    let started = Instant::now();

    loop {
        let pod_list = pods.list(&running).await?;

        // Cache the per-node eligibility verdicts for this round.
        let mut eligible: HashMap<String, bool> = HashMap::new();
        let mut images = ImageNodeMap::new();

        for pod in &pod_list.items {
            let node_name = match pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) {
                Some(name) => name,
                None => continue,
            };
            let node_ok = match eligible.get(node_name) {
                Some(ok) => *ok,
                None => {
                    let node = nodes.get(node_name).await?;
                    let ok = node_can_host(&node, request);
                    eligible.insert(node_name.to_owned(), ok);
                    ok
                }
            };
            if node_ok {
                record_pod_images(&mut images, node_name, pod);
            }
        }

        if !images.is_empty() {
            debug!(images = images.len(), "found candidate images in the cluster");
            return Ok(images);
        }

        if started.elapsed() + POLL_INTERVAL >= deadline {
            return Err(Error::ImageSearchTimeout(deadline));
        }
        debug!("no images found on any schedulable node, retrying");
        sleep(POLL_INTERVAL).await;
    }
}

/// Orders the map into candidates, one per image, excluding images that were
/// published through the seed registry itself.
pub fn candidates(images: &ImageNodeMap) -> Vec<Candidate> {
    images
        .iter()
        .filter(|(image, _)| !SEED_REGISTRY.is_match(image))
        .filter_map(|(image, nodes)| {
            nodes.first().map(|node| Candidate {
                image: image.clone(),
                node: node.clone(),
            })
        })
        .collect()
}

/// Whether a node could schedule the injector: enough allocatable CPU and
/// memory for its requests and no NoSchedule/NoExecute taint.
fn node_can_host(node: &Node, request: &ResourceRequest) -> bool {
    let name = node.metadata.name.as_deref().unwrap_or_default();

    if has_blocking_taints(node) {
        debug!(node = name, "node is tainted, skipping");
        return false;
    }

    let allocatable = match node.status.as_ref().and_then(|s| s.allocatable.as_ref()) {
        Some(allocatable) => allocatable,
        None => return false,
    };
    let cpu = allocatable.get("cpu").map(parse_cpu_millis);
    let memory = allocatable.get("memory").map(parse_memory_bytes);
    match (cpu, memory) {
        (Some(Ok(cpu)), Some(Ok(memory))) => {
            cpu >= request.cpu_millis && memory >= request.memory_bytes
        }
        _ => {
            warn!(node = name, "node reported missing or unparseable allocatable resources");
            false
        }
    }
}

fn has_blocking_taints(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|taint| taint.effect == "NoSchedule" || taint.effect == "NoExecute")
        })
        .unwrap_or(false)
}

/// Records every init, regular, and ephemeral container image of `pod` against
/// `node`, deduplicating node entries per image.
fn record_pod_images(images: &mut ImageNodeMap, node: &str, pod: &Pod) {
    let spec = match pod.spec.as_ref() {
        Some(spec) => spec,
        None => return,
    };
    let mut record = |image: Option<&String>| {
        if let Some(image) = image {
            let nodes = images.entry(image.clone()).or_default();
            if !nodes.iter().any(|existing| existing == node) {
                nodes.push(node.to_owned());
            }
        }
    };
    for container in spec.init_containers.iter().flatten() {
        record(container.image.as_ref());
    }
    for container in &spec.containers {
        record(container.image.as_ref());
    }
    for container in spec.ephemeral_containers.iter().flatten() {
        record(container.image.as_ref());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, EphemeralContainer, NodeSpec, NodeStatus, PodSpec, Taint,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    fn request() -> ResourceRequest {
        ResourceRequest {
            cpu_millis: 500,
            memory_bytes: 64 << 20,
        }
    }

    fn node(name: &str, cpu: &str, memory: &str, taints: Vec<Taint>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints: if taints.is_empty() { None } else { Some(taints) },
                ..Default::default()
            }),
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([
                    ("cpu".to_owned(), Quantity(cpu.to_owned())),
                    ("memory".to_owned(), Quantity(memory.to_owned())),
                ])),
                ..Default::default()
            }),
        }
    }

    fn taint(effect: &str) -> Taint {
        Taint {
            effect: effect.to_owned(),
            key: "node.kubernetes.io/unreachable".to_owned(),
            ..Default::default()
        }
    }

    fn pod_on(node: &str, images: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("workload".to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_owned()),
                containers: images
                    .iter()
                    .map(|image| Container {
                        name: "app".to_owned(),
                        image: Some((*image).to_owned()),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn node_with_enough_resources_is_eligible() {
        assert!(node_can_host(&node("n1", "4", "8Gi", vec![]), &request()));
    }

    #[test]
    fn node_below_cpu_or_memory_request_is_excluded() {
        assert!(!node_can_host(&node("n1", "250m", "8Gi", vec![]), &request()));
        assert!(!node_can_host(&node("n1", "4", "32Mi", vec![]), &request()));
    }

    #[test]
    fn tainted_nodes_are_excluded() {
        let req = request();
        assert!(!node_can_host(&node("n1", "4", "8Gi", vec![taint("NoSchedule")]), &req));
        assert!(!node_can_host(&node("n1", "4", "8Gi", vec![taint("NoExecute")]), &req));
        assert!(node_can_host(
            &node("n1", "4", "8Gi", vec![taint("PreferNoSchedule")]),
            &req
        ));
    }

    #[test]
    fn unparseable_allocatable_resources_exclude_the_node() {
        assert!(!node_can_host(&node("n1", "lots", "8Gi", vec![]), &request()));
    }

    #[test]
    fn all_container_kinds_are_recorded_and_nodes_deduplicated() {
        let mut images = ImageNodeMap::new();
        let mut pod = pod_on("n1", &["ubuntu:latest"]);
        let spec = pod.spec.as_mut().unwrap();
        spec.init_containers = Some(vec![Container {
            name: "init".to_owned(),
            image: Some("busybox:1.36".to_owned()),
            ..Default::default()
        }]);
        spec.ephemeral_containers = Some(vec![EphemeralContainer {
            name: "debug".to_owned(),
            image: Some("alpine:3".to_owned()),
            ..Default::default()
        }]);

        record_pod_images(&mut images, "n1", &pod);
        record_pod_images(&mut images, "n1", &pod);

        assert_eq!(images.len(), 3);
        assert_eq!(images["ubuntu:latest"], vec!["n1".to_owned()]);
        assert_eq!(images["busybox:1.36"], vec!["n1".to_owned()]);
        assert_eq!(images["alpine:3"], vec!["n1".to_owned()]);
    }

    #[test]
    fn candidates_skip_seed_registry_images() {
        let mut images = ImageNodeMap::new();
        images.insert("127.0.0.1:31999/registry:2.8.3".to_owned(), vec!["n1".to_owned()]);
        images.insert("ubuntu:latest".to_owned(), vec!["n1".to_owned(), "n2".to_owned()]);

        let found = candidates(&images);
        assert_eq!(
            found,
            vec![Candidate {
                image: "ubuntu:latest".to_owned(),
                node: "n1".to_owned(),
            }]
        );
    }
}
