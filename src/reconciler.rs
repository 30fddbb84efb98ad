//! Workload reconciliation
//!
//! A reconciler worker pulls one [`WorkloadKey`] at a time and converges the
//! cluster for it. The algorithm reads current state on every attempt and
//! keeps nothing between attempts, so running it twice, concurrently with a
//! crash, or after a partial failure always drives towards the same end state:
//!
//! - **Workload present**: a default-deny NetworkPolicy and a Service exist
//!   under the workload's name, selecting its pod-template labels.
//! - **Workload absent**: neither derived object exists.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{ClusterClient, Workload};
use crate::config::ControllerConfig;
use crate::feed::WorkloadCache;
use crate::key::WorkloadKey;
use crate::metrics;
use crate::queue::WorkQueue;
use crate::resources::{
    build_network_policy, build_service, is_managed, network_policy_matches, service_matches,
    ServicePortSpec,
};
use crate::{Error, Result};

/// Result of one reconciliation attempt
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The cluster matches the desired state for the key
    Converged,
    /// A transient failure; the key should be retried after backoff
    Retry(Error),
    /// A failure that retrying cannot fix; the key is dropped
    Fatal(Error),
}

impl ReconcileOutcome {
    /// Classify an error by whether retrying could help
    pub fn from_error(error: Error) -> Self {
        if error.is_retryable() {
            Self::Retry(error)
        } else {
            Self::Fatal(error)
        }
    }

    /// Metric label for this outcome
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Retry(_) => "retry",
            Self::Fatal(_) => "fatal",
        }
    }

    /// True if the key converged
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Converges derived objects for workload keys taken from the queue
pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    cache: Arc<dyn WorkloadCache>,
    queue: Arc<WorkQueue<WorkloadKey>>,
    service_port: ServicePortSpec,
    max_retries: u32,
}

impl Reconciler {
    /// Create a reconciler sharing `queue` with the dispatcher
    pub fn new(
        client: Arc<dyn ClusterClient>,
        cache: Arc<dyn WorkloadCache>,
        queue: Arc<WorkQueue<WorkloadKey>>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            client,
            cache,
            queue,
            service_port: config.service_port.clone(),
            max_retries: config.max_retries,
        }
    }

    /// Run one worker until the queue shuts down
    pub async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "reconcile worker started");
        while self.process_next_item().await {}
        debug!(worker, "reconcile worker stopped");
    }

    /// Take one key from the queue and reconcile it
    ///
    /// Returns `false` once the queue is shutting down.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let outcome = self.reconcile(&key).await;
        self.handle_outcome(&key, outcome);
        self.queue.done(&key);
        true
    }

    /// Converge the cluster for one workload key
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn reconcile(&self, key: &WorkloadKey) -> ReconcileOutcome {
        if let Err(e) = key.validate() {
            return ReconcileOutcome::Fatal(e);
        }

        let start = Instant::now();
        let (branch, result) = match self.client.get_workload(key).await {
            Ok(workload) => ("sync", self.sync(key, workload).await),
            Err(e) if e.is_not_found() => ("delete", self.delete(key).await),
            Err(e) => ("fetch", Err(e)),
        };
        metrics::RECONCILE_DURATION.record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("branch", branch)],
        );

        match result {
            Ok(()) => {
                debug!(branch, "workload converged");
                ReconcileOutcome::Converged
            }
            Err(e) => ReconcileOutcome::from_error(e),
        }
    }

    /// Apply the queue policy for an outcome
    fn handle_outcome(&self, key: &WorkloadKey, outcome: ReconcileOutcome) {
        metrics::RECONCILE_TOTAL.add(1, &[KeyValue::new("result", outcome.label())]);

        match outcome {
            ReconcileOutcome::Converged => self.queue.forget(key),
            ReconcileOutcome::Retry(e) => {
                let requeues = self.queue.num_requeues(key);
                if requeues < self.max_retries {
                    warn!(key = %key, error = %e, attempt = requeues + 1, "reconcile failed, retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(
                        key = %key,
                        error = %e,
                        retries = requeues,
                        "reconcile failed too many times, dropping workload"
                    );
                    self.queue.forget(key);
                    metrics::ITEMS_DROPPED.add(1, &[KeyValue::new("reason", "max_retries")]);
                }
            }
            ReconcileOutcome::Fatal(e) => {
                error!(key = %key, error = %e, "reconcile failed permanently, dropping workload");
                self.queue.forget(key);
                metrics::ITEMS_DROPPED.add(1, &[KeyValue::new("reason", "fatal")]);
            }
        }
    }

    // =========================================================================
    // Sync branch
    // =========================================================================

    async fn sync(&self, key: &WorkloadKey, workload: Workload) -> Result<()> {
        // The fetched workload is authoritative; the mirror may lag behind it
        let labels = workload.pod_labels;
        if let Some(mirrored) = self.cache.pod_labels(key) {
            if mirrored != labels {
                debug!(key = %key, "workload mirror lags the api server");
            }
        }

        // An empty selector would match every pod in the namespace
        if labels.is_empty() {
            return Err(Error::validation(format!(
                "workload {} has no pod template labels",
                key
            )));
        }

        self.ensure_network_policy(key, &build_network_policy(key, &labels))
            .await?;
        self.ensure_service(key, &build_service(key, &labels, &self.service_port))
            .await
    }

    async fn ensure_network_policy(&self, key: &WorkloadKey, desired: &NetworkPolicy) -> Result<()> {
        match self.client.create_network_policy(key, desired).await {
            Ok(()) => {
                info!(key = %key, "created network policy");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.client.get_network_policy(key).await?;
                if network_policy_matches(&existing, desired) {
                    return Ok(());
                }
                if !is_managed(&existing.metadata) {
                    return Err(Error::conflict(format!(
                        "NetworkPolicy {} exists and is not managed by netsek",
                        key
                    )));
                }
                info!(key = %key, "replacing stale network policy");
                self.client.apply_network_policy(key, desired).await
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_service(&self, key: &WorkloadKey, desired: &Service) -> Result<()> {
        match self.client.create_service(key, desired).await {
            Ok(()) => {
                info!(key = %key, "created service");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                let existing = self.client.get_service(key).await?;
                if service_matches(&existing, desired) {
                    return Ok(());
                }
                if !is_managed(&existing.metadata) {
                    return Err(Error::conflict(format!(
                        "Service {} exists and is not managed by netsek",
                        key
                    )));
                }
                info!(key = %key, "replacing stale service");
                self.client.apply_service(key, desired).await
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Delete branch
    // =========================================================================

    /// Remove both derived objects, treating absent ones as removed
    ///
    /// Objects without the managed-by label are left in place. Both deletes
    /// are attempted even if the first fails.
    async fn delete(&self, key: &WorkloadKey) -> Result<()> {
        let policy = self.delete_network_policy(key).await;
        let service = self.delete_service(key).await;

        if policy.is_ok() && service.is_ok() {
            info!(key = %key, "removed derived objects of deleted workload");
        }
        policy.and(service)
    }

    async fn delete_network_policy(&self, key: &WorkloadKey) -> Result<()> {
        match self.client.get_network_policy(key).await {
            Ok(existing) if !is_managed(&existing.metadata) => {
                info!(key = %key, "leaving network policy not managed by netsek in place");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return absent_ok(Err(e)),
        }
        absent_ok(self.client.delete_network_policy(key).await)
    }

    async fn delete_service(&self, key: &WorkloadKey) -> Result<()> {
        match self.client.get_service(key).await {
            Ok(existing) if !is_managed(&existing.metadata) => {
                info!(key = %key, "leaving service not managed by netsek in place");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return absent_ok(Err(e)),
        }
        absent_ok(self.client.delete_service(key).await)
    }
}

fn absent_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
