//! Port-forwarding tunnels to pods and services.
//!
//! A [`Tunnel`] binds a local TCP listener and forwards every accepted
//! connection to a pod port over the Kubernetes port-forward subresource. It
//! is how the orchestrator verifies the injector from outside the cluster,
//! and the general-purpose door for any later ad-hoc access (registry, git,
//! logging) on clusters with no ingress.
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams};
use lazy_static::lazy_static;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, instrument, trace, warn};

use crate::cluster::selector_string;
use crate::error::{Error, Result};

lazy_static! {
    // Held across the pick-a-free-port gap only; concurrent tunnels must never
    // be handed the same local port.
    static ref PORT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
}

/// Establishment retries after the initial attempt.
const CONNECT_RETRIES: u32 = 3;

/// The resource a tunnel forwards to.
#[derive(Clone, Debug)]
pub enum TunnelTarget {
    /// Forward straight to the named pod.
    Pod(String),
    /// Forward to a ready pod behind the named service's label selector.
    Service(String),
}

/// A local-to-cluster port-forwarding session.
///
/// `connect` and `close` are the only mutators; `connect` takes `&mut self`
/// so it cannot race itself on one tunnel, and `close` consumes the tunnel so
/// a double close is a compile error.
pub struct Tunnel {
    client: kube::Client,
    namespace: String,
    target: TunnelTarget,
    local_port: u16,
    remote_port: u16,
    url_suffix: String,
    session: Option<Session>,
}

struct Session {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Tunnel {
    /// Creates an unconnected tunnel. A `local_port` of 0 asks for an
    /// auto-assigned port, chosen under a process-wide lock at connect time.
    pub fn new(
        client: kube::Client,
        namespace: &str,
        target: TunnelTarget,
        local_port: u16,
        remote_port: u16,
        url_suffix: &str,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
            target,
            local_port,
            remote_port,
            url_suffix: url_suffix.to_owned(),
            session: None,
        }
    }

    /// Establishes the tunnel and returns its full local URL.
    ///
    /// Establishment is retried up to three times with linearly increasing
    /// backoff (attempt x 10 seconds); exhausting the budget surfaces
    /// [`Error::TunnelExhausted`].
    #[instrument(skip(self), fields(namespace = %self.namespace, target = ?self.target))]
    pub async fn connect(&mut self) -> Result<String> {
        if self.session.is_some() {
            return Err(Error::TunnelAlreadyConnected);
        }

        let mut attempt = 0;
        loop {
            match self.establish().await {
                Ok(url) => return Ok(url),
                Err(err) => {
                    if attempt >= CONNECT_RETRIES {
                        return Err(Error::TunnelExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    warn!(%err, "tunnel establishment failed, retrying in {:?}", delay);
                    sleep(delay).await;
                }
            }
        }
    }

    /// The resolved local endpoint as a bare `host:port`. Only meaningful
    /// after [`connect`](Tunnel::connect) succeeds; until then an
    /// auto-assigned tunnel still reports port 0.
    pub fn endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.local_port)
    }

    /// The resolved local endpoint as an HTTP URL. Only meaningful after
    /// [`connect`](Tunnel::connect) succeeds.
    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.endpoint())
    }

    /// The HTTP endpoint with the tunnel's URL suffix appended. Only
    /// meaningful after [`connect`](Tunnel::connect) succeeds.
    pub fn full_url(&self) -> String {
        format!("{}{}", self.http_endpoint(), self.url_suffix)
    }

    /// Stops the background forwarding task and waits for it to finish.
    /// Dropping a connected tunnel also stops the task, by closing the
    /// shutdown channel.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown.send(());
            let _ = session.task.await;
        }
    }

    async fn establish(&mut self) -> Result<String> {
        let pod_name = self.resolve_target_pod().await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        // Open and drop one forwarding session up front so an unreachable or
        // unready pod fails establishment here, inside the retry budget.
        let probe = pods.portforward(&pod_name, &[self.remote_port]).await?;
        drop(probe);

        let (listener, local_port) = reserve_local_port(self.local_port).await?;
        self.local_port = local_port;
        debug!(
            local_port,
            remote_port = self.remote_port,
            pod = %pod_name,
            "opening tunnel"
        );

        let remote_port = self.remote_port;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        trace!("tunnel stop signal received");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((conn, peer)) => {
                            trace!(%peer, "accepted tunnel connection");
                            let pods = pods.clone();
                            let pod_name = pod_name.clone();
                            tokio::spawn(async move {
                                if let Err(err) =
                                    forward_connection(&pods, &pod_name, remote_port, conn).await
                                {
                                    warn!(%err, "tunnel connection closed with error");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(%err, "tunnel listener failed");
                            break;
                        }
                    }
                }
            }
        });

        self.session = Some(Session {
            shutdown: shutdown_tx,
            task,
        });
        Ok(self.full_url())
    }

    /// Resolves the pod to forward to: the named pod directly, or the first
    /// ready pod behind the service's label selector.
    async fn resolve_target_pod(&self) -> Result<String> {
        match &self.target {
            TunnelTarget::Pod(name) => Ok(name.clone()),
            TunnelTarget::Service(name) => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
                let service = services.get(name).await?;
                let selector = service
                    .spec
                    .and_then(|spec| spec.selector)
                    .unwrap_or_default();
                if selector.is_empty() {
                    return Err(Error::NoBackingPod(name.clone()));
                }

                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                let backing = pods
                    .list(&ListParams::default().labels(&selector_string(&selector)))
                    .await?;
                backing
                    .items
                    .iter()
                    .find(|pod| pod_ready(pod))
                    .and_then(|pod| pod.metadata.name.clone())
                    .ok_or_else(|| Error::NoBackingPod(name.clone()))
            }
        }
    }
}

/// Binds the local listener. Auto-assignment (`requested` = 0) runs under the
/// process-wide port lock so two tunnels connecting at once never pick the
/// same port.
async fn reserve_local_port(requested: u16) -> Result<(TcpListener, u16)> {
    if requested == 0 {
        let _guard = PORT_LOCK.lock().await;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "auto-assigned local tunnel port");
        Ok((listener, port))
    } else {
        let listener = TcpListener::bind(("127.0.0.1", requested)).await?;
        Ok((listener, requested))
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    pod_name: &str,
    port: u16,
    mut conn: TcpStream,
) -> Result<()> {
    let mut forwarder = pods.portforward(pod_name, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or(Error::MissingPortStream(port))?;
    copy_bidirectional(&mut conn, &mut upstream).await?;
    drop(upstream);
    forwarder.join().await.map_err(std::io::Error::other)?;
    Ok(())
}

fn pod_ready(pod: &Pod) -> bool {
    let status = match pod.status.as_ref() {
        Some(status) => status,
        None => return false,
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status
        .conditions
        .iter()
        .flatten()
        .any(|condition| condition.type_ == "Ready" && condition.status == "True")
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(10 * u64::from(attempt))
}

#[cfg(test)]
mod test {
    use super::*;
    use http::{Request, Response, StatusCode};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use kube::client::Body;
    use kube::Client;

    fn mock_client() -> (
        Client,
        tower_test::mock::Handle<Request<Body>, Response<Body>>,
    ) {
        let (mock_service, handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (Client::new(mock_service, "zarf"), handle)
    }

    fn ready_pod(name: &str) -> serde_json::Value {
        serde_json::json!({
            "metadata": { "name": name, "namespace": "zarf" },
            "spec": { "containers": [{ "name": "injector", "image": "ubuntu:latest" }] },
            "status": {
                "phase": "Running",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        })
    }

    #[tokio::test]
    async fn endpoint_helpers_compose_the_local_url() {
        let (client, _handle) = mock_client();
        let mut tunnel = Tunnel::new(
            client,
            "zarf",
            TunnelTarget::Pod("injector".to_owned()),
            0,
            5000,
            "/v2/",
        );
        tunnel.local_port = 31337;
        assert_eq!(tunnel.endpoint(), "127.0.0.1:31337");
        assert_eq!(tunnel.http_endpoint(), "http://127.0.0.1:31337");
        assert_eq!(tunnel.full_url(), "http://127.0.0.1:31337/v2/");
    }

    #[test]
    fn backoff_grows_linearly() {
        assert_eq!(retry_delay(1), Duration::from_secs(10));
        assert_eq!(retry_delay(2), Duration::from_secs(20));
        assert_eq!(retry_delay(3), Duration::from_secs(30));
    }

    #[test]
    fn pods_without_a_ready_condition_are_not_forward_targets() {
        let pod: Pod = serde_json::from_value(ready_pod("ok")).unwrap();
        assert!(pod_ready(&pod));

        let pending = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!pod_ready(&pending));

        let unready = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_owned()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_owned(),
                    status: "False".to_owned(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(!pod_ready(&unready));
    }

    #[tokio::test(start_paused = true)]
    async fn establishment_failures_retry_then_surface_a_typed_exhaustion() {
        let (client, mut handle) = mock_client();
        // The port-forward subresource never answers with a protocol switch,
        // so every establishment attempt fails.
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(
                    request.uri().path(),
                    "/api/v1/namespaces/zarf/pods/injector/portforward"
                );
                send.send_response(
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Body::from(
                            serde_json::to_vec(&serde_json::json!({
                                "kind": "Status",
                                "apiVersion": "v1",
                                "status": "Failure",
                                "message": "not found",
                                "reason": "NotFound",
                                "code": 404
                            }))
                            .unwrap(),
                        ))
                        .unwrap(),
                );
            }
        });

        let mut tunnel = Tunnel::new(
            client,
            "zarf",
            TunnelTarget::Pod("injector".to_owned()),
            0,
            5000,
            "",
        );
        let started = tokio::time::Instant::now();
        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, Error::TunnelExhausted { attempts: 3, .. }));
        // Linear backoff between the four attempts: 10s + 20s + 30s.
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn concurrent_auto_assignment_never_hands_out_the_same_port() {
        let (first, second) = tokio::join!(reserve_local_port(0), reserve_local_port(0));
        let (_l1, p1) = first.unwrap();
        let (_l2, p2) = second.unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn service_targets_resolve_to_a_ready_backing_pod() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("service get");
            assert_eq!(
                request.uri().path(),
                "/api/v1/namespaces/zarf/services/zarf-injector"
            );
            let service = serde_json::json!({
                "metadata": { "name": "zarf-injector", "namespace": "zarf" },
                "spec": { "selector": { "app": "zarf-injector" }, "ports": [{ "port": 5000 }] }
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&service).unwrap()))
                    .unwrap(),
            );

            let (request, send) = handle.next_request().await.expect("pod list");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/zarf/pods");
            assert!(request
                .uri()
                .query()
                .unwrap()
                .contains("app%3Dzarf-injector"));
            let list = serde_json::json!({
                "kind": "PodList",
                "apiVersion": "v1",
                "metadata": {},
                "items": [ready_pod("injector")]
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
        });

        let tunnel = Tunnel::new(
            client,
            "zarf",
            TunnelTarget::Service("zarf-injector".to_owned()),
            0,
            5000,
            "",
        );
        let pod = tunnel.resolve_target_pod().await.unwrap();
        assert_eq!(pod, "injector");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn service_targets_without_ready_pods_fail_resolution() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            let (_, send) = handle.next_request().await.expect("service get");
            let service = serde_json::json!({
                "metadata": { "name": "zarf-injector", "namespace": "zarf" },
                "spec": { "selector": { "app": "zarf-injector" } }
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&service).unwrap()))
                    .unwrap(),
            );

            let (_, send) = handle.next_request().await.expect("pod list");
            let list = serde_json::json!({
                "kind": "PodList",
                "apiVersion": "v1",
                "metadata": {},
                "items": []
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&list).unwrap()))
                    .unwrap(),
            );
        });

        let tunnel = Tunnel::new(
            client,
            "zarf",
            TunnelTarget::Service("zarf-injector".to_owned()),
            0,
            5000,
            "",
        );
        match tunnel.resolve_target_pod().await {
            Err(Error::NoBackingPod(name)) => assert_eq!(name, "zarf-injector"),
            other => panic!("expected NoBackingPod, got {:?}", other.map(|_| ())),
        }
        server.await.unwrap();
    }
}
