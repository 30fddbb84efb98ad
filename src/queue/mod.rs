//! Deduplicating, rate-limited work queue
//!
//! The queue is the only structure shared by the notification side (the
//! dispatcher) and the processing side (reconciler workers). It guarantees:
//!
//! - **Deduplication**: a key is pending at most once, no matter how many
//!   times it is added before a worker picks it up.
//! - **Per-key serialization**: a key handed out by [`WorkQueue::get`] is not
//!   handed out again until [`WorkQueue::done`] is called for it.
//! - **No lost updates**: adding a key while it is being processed marks it
//!   dirty; `done` puts it back on the queue exactly once.
//!
//! Retries go through [`WorkQueue::add_rate_limited`], which delays the re-add
//! according to the [`RateLimiter`].

mod rate_limiter;

pub use rate_limiter::{BackoffConfig, BucketConfig, RateLimiter, RateLimiterConfig};

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics;

struct QueueState<K> {
    /// Keys waiting for a worker, in arrival order
    queue: VecDeque<K>,
    /// Keys that need processing (queued, or re-added while in flight)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
}

/// Work queue keyed by `K`
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<QueueState<K>>,
    notify: Notify,
    limiter: RateLimiter<K>,
    shutdown: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
{
    /// Create a named queue with the given retry rate limits
    pub fn new(name: impl Into<String>, limiter: RateLimiterConfig) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
            }),
            notify: Notify::new(),
            limiter: RateLimiter::new(limiter),
            shutdown: CancellationToken::new(),
        }
    }

    /// Name of the queue, used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `key` unless it is already pending
    ///
    /// A key that is currently being processed is marked dirty and re-queued
    /// when its worker calls [`WorkQueue::done`]. Adds after shutdown are
    /// ignored.
    pub fn add(&self, key: K) {
        if self.is_shutting_down() {
            trace!(queue = %self.name, key = %key, "queue shutting down, ignoring add");
            return;
        }

        let depth = {
            let mut state = self.state.lock();
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                trace!(queue = %self.name, key = %key, "key in flight, deferring until done");
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };

        self.record_depth(depth);
        self.notify.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once the queue is shutting down. The caller owns the key
    /// until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();

            if self.is_shutting_down() {
                return None;
            }

            let next = {
                let mut state = self.state.lock();
                match state.queue.pop_front() {
                    Some(key) => {
                        state.dirty.remove(&key);
                        state.processing.insert(key.clone());
                        Some((key, state.queue.len()))
                    }
                    None => None,
                }
            };

            if let Some((key, depth)) = next {
                self.record_depth(depth);
                return Some(key);
            }

            tokio::select! {
                _ = notified => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Mark processing of `key` finished
    ///
    /// If the key was added again while in flight, it goes back on the queue.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) && !self.shutdown.is_cancelled() {
                state.queue.push_back(key.clone());
                Some(state.queue.len())
            } else {
                None
            }
        };

        if let Some(depth) = requeued {
            debug!(queue = %self.name, key = %key, "re-queued key updated while in flight");
            self.record_depth(depth);
            self.notify.notify_one();
        }
    }

    /// Clear the retry history of `key` after it converged or was dropped
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Number of rate-limited retries of `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Re-add `key` after its rate-limited delay
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.when(&key);
        debug!(
            queue = %self.name,
            key = %key,
            delay_ms = delay.as_millis(),
            requeues = self.limiter.num_requeues(&key),
            "scheduling rate-limited retry"
        );
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has passed
    ///
    /// The delayed add is abandoned if the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True if no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every blocked [`WorkQueue::get`]
    pub fn shut_down(&self) {
        debug!(queue = %self.name, "shutting down work queue");
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn record_depth(&self, depth: usize) {
        metrics::QUEUE_DEPTH.record(
            i64::try_from(depth).unwrap_or(i64::MAX),
            &[KeyValue::new("queue", self.name.clone())],
        );
    }
}
