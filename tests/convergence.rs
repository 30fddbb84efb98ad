//! Convergence tests for the full controller wiring
//!
//! These tests run the real change feed, dispatcher, work queue and
//! reconciler workers against an in-memory control plane. Watch events are
//! fed through a channel, so each test controls exactly what the controller
//! observes and when.
//!
//! ```bash
//! cargo test --test convergence
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use netsek::client::{ClusterClient, Workload};
use netsek::config::ControllerConfig;
use netsek::key::WorkloadKey;
use netsek::resources::{
    build_network_policy, build_service, PodLabels, ServicePortSpec, NETWORK_POLICY_KIND,
    SERVICE_KIND,
};
use netsek::{controller, Error, Result};

// =============================================================================
// In-memory control plane
// =============================================================================

#[derive(Default)]
struct ClusterState {
    workloads: BTreeMap<WorkloadKey, PodLabels>,
    services: BTreeMap<WorkloadKey, Service>,
    policies: BTreeMap<WorkloadKey, NetworkPolicy>,
    creates: usize,
    replaces: usize,
    /// Service creates that fail with a server error before succeeding
    failing_service_creates: u32,
}

#[derive(Default)]
struct FakeCluster {
    state: Mutex<ClusterState>,
}

fn server_error() -> Error {
    Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the server is currently unable to handle the request".to_string(),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_workload(&self, key: &WorkloadKey) -> Result<Workload> {
        let state = self.state.lock();
        state
            .workloads
            .get(key)
            .map(|labels| Workload {
                key: key.clone(),
                pod_labels: labels.clone(),
            })
            .ok_or_else(|| Error::not_found("Deployment", &key.namespace, &key.name))
    }

    async fn get_service(&self, key: &WorkloadKey) -> Result<Service> {
        self.state
            .lock()
            .services
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(SERVICE_KIND, &key.namespace, &key.name))
    }

    async fn create_service(&self, key: &WorkloadKey, service: &Service) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_service_creates > 0 {
            state.failing_service_creates -= 1;
            return Err(server_error());
        }
        if state.services.contains_key(key) {
            return Err(Error::already_exists(SERVICE_KIND, &key.namespace, &key.name));
        }
        state.services.insert(key.clone(), service.clone());
        state.creates += 1;
        Ok(())
    }

    async fn apply_service(&self, key: &WorkloadKey, service: &Service) -> Result<()> {
        let mut state = self.state.lock();
        state.services.insert(key.clone(), service.clone());
        state.replaces += 1;
        Ok(())
    }

    async fn delete_service(&self, key: &WorkloadKey) -> Result<()> {
        self.state
            .lock()
            .services
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(SERVICE_KIND, &key.namespace, &key.name))
    }

    async fn get_network_policy(&self, key: &WorkloadKey) -> Result<NetworkPolicy> {
        self.state
            .lock()
            .policies
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(NETWORK_POLICY_KIND, &key.namespace, &key.name))
    }

    async fn create_network_policy(
        &self,
        key: &WorkloadKey,
        policy: &NetworkPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.policies.contains_key(key) {
            return Err(Error::already_exists(
                NETWORK_POLICY_KIND,
                &key.namespace,
                &key.name,
            ));
        }
        state.policies.insert(key.clone(), policy.clone());
        state.creates += 1;
        Ok(())
    }

    async fn apply_network_policy(
        &self,
        key: &WorkloadKey,
        policy: &NetworkPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.policies.insert(key.clone(), policy.clone());
        state.replaces += 1;
        Ok(())
    }

    async fn delete_network_policy(&self, key: &WorkloadKey) -> Result<()> {
        self.state
            .lock()
            .policies
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(NETWORK_POLICY_KIND, &key.namespace, &key.name))
    }
}

impl FakeCluster {
    fn policy_selector(&self, key: &WorkloadKey) -> Option<PodLabels> {
        self.state
            .lock()
            .policies
            .get(key)
            .and_then(|np| np.spec.as_ref())
            .and_then(|spec| spec.pod_selector.match_labels.clone())
    }

    fn service_selector(&self, key: &WorkloadKey) -> Option<PodLabels> {
        self.state
            .lock()
            .services
            .get(key)
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.selector.clone())
    }

    fn has_derived(&self, key: &WorkloadKey) -> (bool, bool) {
        let state = self.state.lock();
        (state.policies.contains_key(key), state.services.contains_key(key))
    }
}

// =============================================================================
// Harness
// =============================================================================

type Event = std::result::Result<watcher::Event<Deployment>, watcher::Error>;

struct Harness {
    cluster: Arc<FakeCluster>,
    events: mpsc::UnboundedSender<Event>,
    shutdown: CancellationToken,
    controller: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(cluster: Arc<FakeCluster>) -> Self {
        let (events, rx) = mpsc::unbounded();
        let shutdown = CancellationToken::new();
        let config = ControllerConfig {
            cache_sync_timeout: Duration::from_secs(5),
            resync_period: None,
            ..Default::default()
        };
        let controller = tokio::spawn(controller::run(
            cluster.clone(),
            rx,
            config,
            shutdown.clone(),
        ));
        Self {
            cluster,
            events,
            shutdown,
            controller,
        }
    }

    fn send(&self, event: watcher::Event<Deployment>) {
        self.events
            .unbounded_send(Ok(event))
            .expect("controller stopped reading events");
    }

    fn list(&self, deployments: Vec<Deployment>) {
        self.send(watcher::Event::Init);
        for d in deployments {
            self.send(watcher::Event::InitApply(d));
        }
        self.send(watcher::Event::InitDone);
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = self.controller.await.expect("controller task panicked");
        assert!(result.is_ok(), "controller failed: {result:?}");
    }
}

fn labels(pairs: &[(&str, &str)]) -> PodLabels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn deployment(key: &WorkloadKey, pod_labels: &PodLabels) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels.clone()),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let in-flight work settle before asserting that nothing changed
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

// =============================================================================
// Scenarios
// =============================================================================

/// Story: default/web with {app: web} gets its policy and service
#[tokio::test]
async fn story_web_deployment_is_isolated_and_exposed() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    cluster
        .state
        .lock()
        .workloads
        .insert(web.clone(), web_labels.clone());

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);

    eventually("derived objects", || cluster.has_derived(&web) == (true, true)).await;

    let policy = cluster.get_network_policy(&web).await.unwrap();
    let spec = policy.spec.unwrap();
    assert_eq!(spec.pod_selector.match_labels, Some(web_labels.clone()));
    assert!(spec.ingress.unwrap_or_default().is_empty());
    assert!(spec.egress.unwrap_or_default().is_empty());

    let service = cluster.get_service(&web).await.unwrap();
    let spec = service.spec.unwrap();
    assert_eq!(spec.selector, Some(web_labels));
    let ports = spec.ports.unwrap();
    assert_eq!(ports.len(), 1);
    assert_eq!(ports[0].name.as_deref(), Some("http"));
    assert_eq!(ports[0].port, 80);

    harness.stop().await;
}

/// Story: Repeated notifications for a converged workload change nothing
#[tokio::test]
async fn story_repeated_notifications_are_idempotent() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    cluster
        .state
        .lock()
        .workloads
        .insert(web.clone(), web_labels.clone());

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);
    eventually("derived objects", || cluster.has_derived(&web) == (true, true)).await;

    for _ in 0..20 {
        harness.send(watcher::Event::Apply(deployment(&web, &web_labels)));
    }
    settle().await;

    {
        let state = cluster.state.lock();
        assert_eq!(state.creates, 2);
        assert_eq!(state.replaces, 0);
        assert_eq!(state.policies.len(), 1);
        assert_eq!(state.services.len(), 1);
    }

    harness.stop().await;
}

/// Story: A crash left only the policy behind; restart completes the pair
#[tokio::test]
async fn story_partial_state_converges_after_restart() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    {
        let mut state = cluster.state.lock();
        state.workloads.insert(web.clone(), web_labels.clone());
        state
            .policies
            .insert(web.clone(), build_network_policy(&web, &web_labels));
    }

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);

    eventually("service", || cluster.has_derived(&web) == (true, true)).await;
    assert_eq!(cluster.state.lock().replaces, 0);

    harness.stop().await;
}

/// Story: Deleting the workload removes both derived objects
#[tokio::test]
async fn story_deleted_workload_is_cleaned_up() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    cluster
        .state
        .lock()
        .workloads
        .insert(web.clone(), web_labels.clone());

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);
    eventually("derived objects", || cluster.has_derived(&web) == (true, true)).await;

    cluster.state.lock().workloads.remove(&web);
    harness.send(watcher::Event::Delete(deployment(&web, &web_labels)));

    eventually("cleanup", || cluster.has_derived(&web) == (false, false)).await;

    harness.stop().await;
}

/// Story: Deleting a workload whose derived objects are already gone is fine
#[tokio::test]
async fn story_delete_of_absent_objects_converges() {
    let ghost = WorkloadKey::new("default", "ghost");
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    cluster
        .state
        .lock()
        .workloads
        .insert(web.clone(), web_labels.clone());

    let harness = Harness::start(cluster.clone());
    harness.list(vec![]);
    harness.send(watcher::Event::Delete(deployment(&ghost, &labels(&[("app", "ghost")]))));

    // A later workload still converges, so the ghost did not wedge the queue
    harness.send(watcher::Event::Apply(deployment(&web, &web_labels)));
    eventually("web derived objects", || cluster.has_derived(&web) == (true, true)).await;
    assert_eq!(cluster.has_derived(&ghost), (false, false));

    harness.stop().await;
}

/// Story: A user-owned service sharing the workload's name is never deleted
#[tokio::test]
async fn story_foreign_service_survives_workload_deletion() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let mut foreign = build_service(&web, &web_labels, &ServicePortSpec::default());
    foreign.metadata.labels = None;

    let cluster = Arc::new(FakeCluster::default());
    {
        let mut state = cluster.state.lock();
        state.workloads.insert(web.clone(), web_labels.clone());
        state.services.insert(web.clone(), foreign);
    }

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);
    eventually("network policy", || cluster.has_derived(&web) == (true, true)).await;

    cluster.state.lock().workloads.remove(&web);
    harness.send(watcher::Event::Delete(deployment(&web, &web_labels)));

    eventually("policy cleanup", || cluster.has_derived(&web) == (false, true)).await;
    settle().await;
    assert_eq!(cluster.has_derived(&web), (false, true));
    assert_eq!(cluster.state.lock().replaces, 0);

    harness.stop().await;
}

/// Story: Relabelling a live workload moves both selectors
#[tokio::test]
async fn story_label_change_updates_selectors() {
    let web = WorkloadKey::new("default", "web");
    let v1 = labels(&[("app", "web")]);
    let v2 = labels(&[("app", "web"), ("tier", "frontend")]);

    let cluster = Arc::new(FakeCluster::default());
    cluster.state.lock().workloads.insert(web.clone(), v1.clone());

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &v1)]);
    eventually("initial selectors", || {
        cluster.policy_selector(&web) == Some(v1.clone())
            && cluster.service_selector(&web) == Some(v1.clone())
    })
    .await;

    cluster.state.lock().workloads.insert(web.clone(), v2.clone());
    harness.send(watcher::Event::Apply(deployment(&web, &v2)));

    eventually("updated selectors", || {
        cluster.policy_selector(&web) == Some(v2.clone())
            && cluster.service_selector(&web) == Some(v2.clone())
    })
    .await;

    harness.stop().await;
}

/// Story: A workload deleted while the watch was down is cleaned up on relist
#[tokio::test]
async fn story_relist_cleans_up_workloads_deleted_while_disconnected() {
    let web = WorkloadKey::new("default", "web");
    let api = WorkloadKey::new("prod", "api");
    let web_labels = labels(&[("app", "web")]);
    let api_labels = labels(&[("app", "api")]);

    let cluster = Arc::new(FakeCluster::default());
    {
        let mut state = cluster.state.lock();
        state.workloads.insert(web.clone(), web_labels.clone());
        state.workloads.insert(api.clone(), api_labels.clone());
    }

    let harness = Harness::start(cluster.clone());
    harness.list(vec![
        deployment(&web, &web_labels),
        deployment(&api, &api_labels),
    ]);
    eventually("both workloads", || {
        cluster.has_derived(&web) == (true, true) && cluster.has_derived(&api) == (true, true)
    })
    .await;

    // The delete event for prod/api is never delivered
    cluster.state.lock().workloads.remove(&api);
    harness.list(vec![deployment(&web, &web_labels)]);

    eventually("api cleanup", || cluster.has_derived(&api) == (false, false)).await;
    assert_eq!(cluster.has_derived(&web), (true, true));

    harness.stop().await;
}

/// Story: Transient API failures are retried until the workload converges
#[tokio::test]
async fn story_transient_failures_are_retried() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    {
        let mut state = cluster.state.lock();
        state.workloads.insert(web.clone(), web_labels.clone());
        state.failing_service_creates = 3;
    }

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);

    eventually("derived objects", || cluster.has_derived(&web) == (true, true)).await;
    assert_eq!(cluster.state.lock().failing_service_creates, 0);

    harness.stop().await;
}

/// Story: A stale managed service left by an older configuration is replaced
#[tokio::test]
async fn story_stale_managed_service_is_replaced() {
    let web = WorkloadKey::new("default", "web");
    let web_labels = labels(&[("app", "web")]);

    let cluster = Arc::new(FakeCluster::default());
    {
        let mut state = cluster.state.lock();
        state.workloads.insert(web.clone(), web_labels.clone());
        state.services.insert(
            web.clone(),
            build_service(
                &web,
                &web_labels,
                &ServicePortSpec {
                    name: "web".to_string(),
                    port: 8080,
                },
            ),
        );
    }

    let harness = Harness::start(cluster.clone());
    harness.list(vec![deployment(&web, &web_labels)]);

    eventually("service port replaced", || {
        cluster
            .state
            .lock()
            .services
            .get(&web)
            .and_then(|svc| svc.spec.as_ref())
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| ports.first().map(|p| p.port))
            == Some(80)
    })
    .await;
    assert_eq!(cluster.state.lock().replaces, 1);

    harness.stop().await;
}
