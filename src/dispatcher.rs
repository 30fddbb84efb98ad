//! Notification dispatcher
//!
//! Turns change-feed notifications into queued [`WorkloadKey`]s. All three
//! notification kinds enqueue the same key: the reconciler reads the current
//! state of the cluster and decides whether the workload exists, so the
//! dispatcher never needs to.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use tracing::{trace, warn};

use crate::feed::WorkloadEventHandler;
use crate::key::WorkloadKey;
use crate::queue::WorkQueue;

/// Change-feed handler that feeds the work queue
pub struct Dispatcher {
    queue: Arc<WorkQueue<WorkloadKey>>,
}

impl Dispatcher {
    /// Create a dispatcher for `queue`
    pub fn new(queue: Arc<WorkQueue<WorkloadKey>>) -> Self {
        Self { queue }
    }

    fn enqueue(&self, event: &'static str, deployment: &Deployment) {
        match WorkloadKey::from_deployment(deployment) {
            Some(key) => {
                trace!(event, key = %key, "enqueue workload");
                self.queue.add(key);
            }
            None => warn!(
                event,
                name = ?deployment.metadata.name,
                namespace = ?deployment.metadata.namespace,
                "dropping notification for workload without namespace or name"
            ),
        }
    }
}

impl WorkloadEventHandler for Dispatcher {
    fn on_add(&self, deployment: &Deployment) {
        self.enqueue("add", deployment);
    }

    fn on_update(&self, deployment: &Deployment) {
        self.enqueue("update", deployment);
    }

    fn on_delete(&self, deployment: &Deployment) {
        self.enqueue("delete", deployment);
    }
}
