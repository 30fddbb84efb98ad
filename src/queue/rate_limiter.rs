//! Retry delays for the work queue
//!
//! The delay for a failed key is the larger of two limits:
//!
//! - **Per-key exponential backoff**: each consecutive failure of the same key
//!   doubles its delay, from `initial_delay` up to `max_delay`.
//! - **Overall token bucket**: caps the aggregate retry rate across all keys
//!   so a mass failure (API server outage) does not turn into a retry storm.
//!
//! The defaults (5ms..1000s, 10 per second with a burst of 100) match the
//! default controller rate limiter of the Kubernetes client libraries.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

/// Exponential backoff settings for a single key
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Delay to apply after `failures` previous failures of the same key
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(62) as i32;
        let delay = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            delay * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            delay
        };

        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Token bucket settings shared by all keys
#[derive(Clone, Debug)]
pub struct BucketConfig {
    /// Sustained retries per second (0 disables the bucket)
    pub qps: f64,
    /// Retries allowed back to back before the rate applies
    pub burst: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Rate limiter configuration for a work queue
#[derive(Clone, Debug, Default)]
pub struct RateLimiterConfig {
    /// Per-key exponential backoff
    pub backoff: BackoffConfig,
    /// Overall token bucket
    pub bucket: BucketConfig,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Token bucket that hands out reservations instead of blocking
struct TokenBucket {
    config: BucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(config: BucketConfig) -> Self {
        let tokens = f64::from(config.burst);
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens,
                last: Instant::now(),
            }),
        }
    }

    /// Take one token and return how long the caller must wait for it
    fn reserve(&self) -> Duration {
        if self.config.qps <= 0.0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.qps).min(f64::from(self.config.burst));
        state.last = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.config.qps)
        }
    }
}

/// Combined per-key backoff and overall token bucket
pub struct RateLimiter<K> {
    backoff: BackoffConfig,
    failures: Mutex<HashMap<K, u32>>,
    bucket: TokenBucket,
}

impl<K: Clone + Eq + Hash> RateLimiter<K> {
    /// Create a rate limiter from configuration
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            backoff: config.backoff,
            failures: Mutex::new(HashMap::new()),
            bucket: TokenBucket::new(config.bucket),
        }
    }

    /// Record a failure of `key` and return the delay before its retry
    pub fn when(&self, key: &K) -> Duration {
        let per_key = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*count);
            *count = count.saturating_add(1);
            delay
        };

        per_key.max(self.bucket.reserve())
    }

    /// Clear the failure history of `key`
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}
