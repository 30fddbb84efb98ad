//! Controller wiring
//!
//! Builds every component in dependency order and owns their lifetimes:
//!
//! 1. Work queue, then the dispatcher holding it
//! 2. Change feed delivering to the dispatcher, running as its own task
//! 3. Wait for the mirror's initial listing
//! 4. Reconciler workers sharing the queue
//!
//! Cancelling the shutdown token stops the feed, shuts the queue down and
//! waits for every worker to finish its in-flight key.

use std::sync::Arc;

use futures::Stream;
use k8s_openapi::api::apps::v1::Deployment;
use kube::runtime::watcher;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::ClusterClient;
use crate::config::ControllerConfig;
use crate::dispatcher::Dispatcher;
use crate::feed::{ChangeFeed, WorkloadCache};
use crate::key::WorkloadKey;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::{Error, Result};

/// Name of the workload queue in logs and metrics
pub const QUEUE_NAME: &str = "workloads";

/// Run the controller until `shutdown` is cancelled
///
/// `events` is the workload watch stream, normally
/// [`crate::feed::workload_watch`]. Fails if the configuration is invalid,
/// the mirror does not sync within `cache_sync_timeout`, or the watch stream
/// ends on its own. A stream ending before the first listing completes
/// fails startup immediately.
pub async fn run<S>(
    client: Arc<dyn ClusterClient>,
    events: S,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<watcher::Event<Deployment>, watcher::Error>>
        + Send
        + 'static,
{
    config.validate()?;

    let queue: Arc<WorkQueue<WorkloadKey>> =
        Arc::new(WorkQueue::new(QUEUE_NAME, config.rate_limiter.clone()));
    let dispatcher = Arc::new(Dispatcher::new(queue.clone()));

    let (feed, store) = ChangeFeed::new(dispatcher, config.resync_period);
    let feed_shutdown = shutdown.child_token();
    let mut feed_task = tokio::spawn(feed.run(events, feed_shutdown.clone()));

    info!(
        timeout_secs = config.cache_sync_timeout.as_secs(),
        "waiting for workload mirror to sync"
    );
    let synced = tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        ended = &mut feed_task => {
            let reason = match ended {
                Ok(Ok(())) => "change feed stopped".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("change feed task panicked: {e}"),
            };
            queue.shut_down();
            error!(error = %reason, "workload mirror failed to sync");
            return Err(Error::CacheSync(reason));
        }
        ready = tokio::time::timeout(config.cache_sync_timeout, store.wait_until_ready()) => {
            Some(match ready {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::CacheSync(e.to_string())),
                Err(_) => Err(Error::CacheSync(format!(
                    "workload mirror not synced after {:?}",
                    config.cache_sync_timeout
                ))),
            })
        }
    };

    match synced {
        Some(Ok(())) => info!(workloads = store.keys().len(), "workload mirror synced"),
        Some(Err(e)) => {
            error!(error = %e, "workload mirror failed to sync");
            stop_feed(&feed_shutdown, feed_task).await;
            queue.shut_down();
            return Err(e);
        }
        None => {
            info!("shutdown requested before workload mirror synced");
            stop_feed(&feed_shutdown, feed_task).await;
            queue.shut_down();
            return Ok(());
        }
    }

    let reconciler = Arc::new(Reconciler::new(
        client,
        Arc::new(store),
        queue.clone(),
        &config,
    ));
    let workers: Vec<JoinHandle<()>> = (0..config.workers)
        .map(|worker| tokio::spawn(reconciler.clone().run_worker(worker)))
        .collect();
    info!(workers = config.workers, "controller running");

    let feed_finished = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = &mut feed_task => Some(result),
    };

    info!("controller stopping");
    feed_shutdown.cancel();
    queue.shut_down();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "reconcile worker panicked");
        }
    }

    let feed_result = match feed_finished {
        Some(result) => result,
        None => feed_task.await,
    };
    let result = feed_result
        .map_err(|e| Error::internal_with_context("feed", e.to_string()))
        .and_then(|r| r);
    if let Err(e) = &result {
        error!(error = %e, "change feed failed");
    }
    info!("controller stopped");
    result
}

async fn stop_feed(shutdown: &CancellationToken, task: JoinHandle<Result<()>>) {
    shutdown.cancel();
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "change feed stopped with an error"),
        Err(e) => warn!(error = %e, "change feed task panicked"),
    }
}
