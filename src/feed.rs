//! Change feed for workloads
//!
//! Watches Deployments, mirrors them into a reflector [`Store`] and tells a
//! [`WorkloadEventHandler`] about every add, update and delete.
//!
//! Two notifications do not come straight from a watch event:
//!
//! - **Resync**: every `resync_period`, each cached workload is re-delivered
//!   as an update, so derived objects changed behind the controller's back
//!   are eventually repaired.
//! - **Relist deletes**: when the watch desyncs and relists, workloads that
//!   were in the mirror but are missing from the fresh listing are delivered
//!   as deletes. Their delete events were lost while disconnected.

use std::collections::HashSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[cfg(test)]
use mockall::automock;

use crate::key::WorkloadKey;
use crate::resources::{pod_template_labels, PodLabels};
use crate::Error;

/// Server-side timeout of each watch request
///
/// Must stay below the client read timeout.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Receiver of workload notifications
#[cfg_attr(test, automock)]
pub trait WorkloadEventHandler: Send + Sync {
    /// A workload appeared
    fn on_add(&self, deployment: &Deployment);
    /// A known workload changed, or is being re-delivered by a resync
    fn on_update(&self, deployment: &Deployment);
    /// A workload disappeared
    fn on_delete(&self, deployment: &Deployment);
}

/// Read access to the local mirror of workloads
#[cfg_attr(test, automock)]
pub trait WorkloadCache: Send + Sync {
    /// Pod-template labels of a mirrored workload, `None` if not mirrored
    fn pod_labels(&self, key: &WorkloadKey) -> Option<PodLabels>;
    /// Keys of every mirrored workload
    fn keys(&self) -> Vec<WorkloadKey>;
}

impl WorkloadCache for Store<Deployment> {
    fn pod_labels(&self, key: &WorkloadKey) -> Option<PodLabels> {
        self.get(&ObjectRef::new(&key.name).within(&key.namespace))
            .map(|deployment| pod_template_labels(&deployment))
    }

    fn keys(&self) -> Vec<WorkloadKey> {
        self.state()
            .iter()
            .filter_map(|deployment| WorkloadKey::from_deployment(deployment))
            .collect()
    }
}

/// Watch stream of Deployments, optionally restricted to one namespace
///
/// Watch errors are retried with the default backoff, so the stream only
/// yields errors for logging.
pub fn workload_watch(
    client: Client,
    namespace: Option<&str>,
) -> impl Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>> + Send + 'static {
    let api: Api<Deployment> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    watcher(api, watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)).default_backoff()
}

/// Mirror of workloads that notifies a handler about changes
pub struct ChangeFeed {
    writer: Writer<Deployment>,
    store: Store<Deployment>,
    handler: Arc<dyn WorkloadEventHandler>,
    resync_period: Option<Duration>,
    /// Objects seen during an in-progress listing
    relisted: Option<HashSet<ObjectRef<Deployment>>>,
}

impl ChangeFeed {
    /// Create a feed and the reader half of its mirror
    ///
    /// The store becomes ready once the first listing completes.
    pub fn new(
        handler: Arc<dyn WorkloadEventHandler>,
        resync_period: Option<Duration>,
    ) -> (Self, Store<Deployment>) {
        let writer = Writer::default();
        let store = writer.as_reader();
        let feed = Self {
            writer,
            store: store.clone(),
            handler,
            resync_period,
            relisted: None,
        };
        (feed, store)
    }

    /// Consume `events` until shutdown
    ///
    /// Returns an error if the event stream ends on its own.
    pub async fn run<S>(mut self, events: S, shutdown: CancellationToken) -> Result<(), Error>
    where
        S: Stream<Item = Result<watcher::Event<Deployment>, watcher::Error>> + Send,
    {
        let mut events = pin!(events);
        let mut resync = self.resync_period.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        info!(resync_period = ?self.resync_period, "change feed started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("change feed stopping");
                    return Ok(());
                }
                _ = next_tick(&mut resync) => self.resync(),
                next = events.next() => match next {
                    Some(Ok(event)) => self.process(event),
                    Some(Err(e)) => warn!(error = %e, "workload watch failed, retrying"),
                    None => {
                        return Err(Error::internal_with_context(
                            "feed",
                            "workload watch stream ended",
                        ));
                    }
                },
            }
        }
    }

    /// Apply one watch event to the mirror and notify the handler
    pub fn process(&mut self, event: watcher::Event<Deployment>) {
        match &event {
            watcher::Event::Apply(deployment) => {
                let known = self.is_mirrored(deployment);
                self.writer.apply_watcher_event(&event);
                self.notify_applied(known, deployment);
            }
            watcher::Event::Delete(deployment) => {
                self.writer.apply_watcher_event(&event);
                trace!(name = ?deployment.metadata.name, "workload deleted");
                self.handler.on_delete(deployment);
            }
            watcher::Event::Init => {
                debug!("workload listing started");
                self.relisted = Some(HashSet::new());
                self.writer.apply_watcher_event(&event);
            }
            watcher::Event::InitApply(deployment) => {
                // The mirror still holds the previous listing until InitDone
                let known = self.is_mirrored(deployment);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(deployment));
                }
                self.writer.apply_watcher_event(&event);
                self.notify_applied(known, deployment);
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let vanished: Vec<_> = self
                    .store
                    .state()
                    .into_iter()
                    .filter(|deployment| !seen.contains(&ObjectRef::from_obj(&**deployment)))
                    .collect();

                self.writer.apply_watcher_event(&event);

                for deployment in &vanished {
                    debug!(
                        name = ?deployment.metadata.name,
                        namespace = ?deployment.metadata.namespace,
                        "workload vanished during relist"
                    );
                    self.handler.on_delete(deployment);
                }
                info!(
                    workloads = seen.len(),
                    vanished = vanished.len(),
                    "workload listing complete"
                );
            }
        }
    }

    /// Re-deliver every mirrored workload as an update
    pub fn resync(&self) {
        let workloads = self.store.state();
        debug!(workloads = workloads.len(), "resyncing workloads");
        for deployment in &workloads {
            self.handler.on_update(deployment);
        }
    }

    fn is_mirrored(&self, deployment: &Deployment) -> bool {
        self.store.get(&ObjectRef::from_obj(deployment)).is_some()
    }

    fn notify_applied(&self, known: bool, deployment: &Deployment) {
        if known {
            self.handler.on_update(deployment);
        } else {
            self.handler.on_add(deployment);
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
