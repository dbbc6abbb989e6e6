//! Construction of the throwaway injection pod and its NodePort service.
//!
//! Building the specs is pure; creation happens in the orchestrator so a
//! failed candidate can be retried without partial state.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, HTTPGetAction, Pod, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use crate::cluster::{AGENT_LABEL, APP_LABEL, BINARY_CONFIGMAP, INJECTOR_BINARY_KEY, INJECTOR_POD, INJECTOR_SERVICE};
use crate::inventory::Candidate;
use crate::resources::ResourceRequest;

/// Port the injector's registry listens on inside the pod.
pub const REGISTRY_PORT: i32 = 5000;

/// Directory the chunk and executable mounts populate.
const STAGE_DIR: &str = "/zarf-init";

/// Empty directory the injector unpacks the seed image into.
const SEED_DIR: &str = "/zarf-seed";

/// The resources the injection pod requests. The inventory uses the same
/// numbers for its minimum-allocatable check so a selected node is always one
/// the pod actually fits on.
pub fn injector_request() -> ResourceRequest {
    ResourceRequest {
        cpu_millis: 500,
        memory_bytes: 64 << 20,
    }
}

fn injector_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_owned(), Quantity("500m".to_owned())),
            ("memory".to_owned(), Quantity("64Mi".to_owned())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_owned(), Quantity("1".to_owned())),
            ("memory".to_owned(), Quantity("256Mi".to_owned())),
        ])),
        ..Default::default()
    }
}

fn injector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.0.to_owned(), APP_LABEL.1.to_owned()),
        (AGENT_LABEL.0.to_owned(), AGENT_LABEL.1.to_owned()),
    ])
}

/// Builds the injection pod spec for one candidate: pinned to the candidate's
/// node by `nodeName` (the scheduler gets no say), running the candidate's
/// image with `IfNotPresent` pull policy, its working directory populated
/// entirely from the executable and payload chunk ConfigMaps, and a readiness
/// probe against the registry's `/v2/` path with a failure threshold generous
/// enough to cover payload reassembly.
pub fn build_injection_pod(
    namespace: &str,
    candidate: &Candidate,
    payload_config_maps: &[String],
    payload_shasum: &str,
) -> Pod {
    let mut volumes = vec![
        Volume {
            name: "init".to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: BINARY_CONFIGMAP.to_owned(),
                default_mode: Some(0o777),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "seed".to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "init".to_owned(),
            mount_path: format!("{}/{}", STAGE_DIR, INJECTOR_BINARY_KEY),
            sub_path: Some(INJECTOR_BINARY_KEY.to_owned()),
            ..Default::default()
        },
        VolumeMount {
            name: "seed".to_owned(),
            mount_path: SEED_DIR.to_owned(),
            ..Default::default()
        },
    ];

    for name in payload_config_maps {
        volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: name.clone(),
            mount_path: format!("{}/{}", STAGE_DIR, name),
            sub_path: Some(name.clone()),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(INJECTOR_POD.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(injector_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(candidate.node.clone()),
            // The pod is deleted and re-created per attempt, never restarted.
            restart_policy: Some("Never".to_owned()),
            containers: vec![Container {
                name: "injector".to_owned(),
                image: Some(candidate.image.clone()),
                // Some distros can still reach a local or direct-connected
                // registry even in airgap.
                image_pull_policy: Some("IfNotPresent".to_owned()),
                working_dir: Some(STAGE_DIR.to_owned()),
                command: Some(vec![
                    format!("{}/{}", STAGE_DIR, INJECTOR_BINARY_KEY),
                    payload_shasum.to_owned(),
                ]),
                volume_mounts: Some(mounts),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some("/v2/".to_owned()),
                        port: IntOrString::Int(REGISTRY_PORT),
                        ..Default::default()
                    }),
                    period_seconds: Some(2),
                    success_threshold: Some(1),
                    failure_threshold: Some(10),
                    ..Default::default()
                }),
                resources: Some(injector_resources()),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the NodePort service fronting the injection pod.
pub fn build_injector_service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(INJECTOR_SERVICE.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(injector_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_owned()),
            ports: Some(vec![ServicePort {
                port: REGISTRY_PORT,
                ..Default::default()
            }]),
            selector: Some(BTreeMap::from([(
                APP_LABEL.0.to_owned(),
                APP_LABEL.1.to_owned(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            image: "ubuntu:latest".to_owned(),
            node: "worker-1".to_owned(),
        }
    }

    fn chunk_names() -> Vec<String> {
        vec![
            "zarf-payload-000".to_owned(),
            "zarf-payload-001".to_owned(),
            "zarf-payload-002".to_owned(),
        ]
    }

    #[test]
    fn pod_is_pinned_to_the_candidate_node_and_image() {
        let pod = build_injection_pod("zarf", &candidate(), &chunk_names(), "cafe");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("worker-1"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("ubuntu:latest"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
    }

    #[test]
    fn command_invokes_the_injector_with_the_payload_checksum() {
        let pod = build_injection_pod("zarf", &candidate(), &chunk_names(), "cafe");
        let command = pod.spec.unwrap().containers[0].command.clone().unwrap();
        assert_eq!(command, vec!["/zarf-init/zarf-injector", "cafe"]);
    }

    #[test]
    fn every_chunk_gets_a_volume_and_a_mount() {
        let names = chunk_names();
        let pod = build_injection_pod("zarf", &candidate(), &names, "cafe");
        let spec = pod.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        // init + seed + one per chunk
        assert_eq!(volumes.len(), names.len() + 2);
        assert_eq!(mounts.len(), names.len() + 2);

        let chunk_mount = mounts
            .iter()
            .find(|m| m.name == "zarf-payload-001")
            .unwrap();
        assert_eq!(chunk_mount.mount_path, "/zarf-init/zarf-payload-001");
        assert_eq!(chunk_mount.sub_path.as_deref(), Some("zarf-payload-001"));
    }

    #[test]
    fn readiness_probe_polls_the_registry_root() {
        let pod = build_injection_pod("zarf", &candidate(), &chunk_names(), "cafe");
        let probe = pod.spec.unwrap().containers[0].readiness_probe.clone().unwrap();
        let http_get = probe.http_get.unwrap();
        assert_eq!(http_get.path.as_deref(), Some("/v2/"));
        assert_eq!(http_get.port, IntOrString::Int(5000));
        assert_eq!(probe.period_seconds, Some(2));
        assert_eq!(probe.failure_threshold, Some(10));
    }

    #[test]
    fn service_selects_the_injector_pod_over_nodeport() {
        let service = build_injector_service("zarf");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.ports.unwrap()[0].port, 5000);
        assert_eq!(
            spec.selector.unwrap().get("app").map(String::as_str),
            Some("zarf-injector")
        );
    }
}
