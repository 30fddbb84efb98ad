//! Controller configuration
//!
//! [`ControllerConfig`] carries every tunable of the running controller. The
//! binary fills it from command-line flags; tests build it directly.

use std::time::Duration;

use crate::queue::RateLimiterConfig;
use crate::resources::ServicePortSpec;
use crate::Error;

/// Default number of reconciler workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of rate-limited retries before a key is dropped
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default time allowed for the initial listing of workloads
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between full re-deliveries of cached workloads
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Runtime configuration of the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of reconciler workers sharing the queue
    pub workers: usize,
    /// Rate-limited retries allowed per key before it is dropped
    pub max_retries: u32,
    /// Time allowed for the local mirror to finish its initial listing
    pub cache_sync_timeout: Duration,
    /// Interval between full re-deliveries of cached workloads, `None` disables
    pub resync_period: Option<Duration>,
    /// Restrict the watch to one namespace, `None` watches all namespaces
    pub namespace: Option<String>,
    /// Retry delays for the work queue
    pub rate_limiter: RateLimiterConfig,
    /// Port exposed by every derived Service
    pub service_port: ServicePortSpec,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            resync_period: Some(DEFAULT_RESYNC_PERIOD),
            namespace: None,
            rate_limiter: RateLimiterConfig::default(),
            service_port: ServicePortSpec::default(),
        }
    }
}

impl ControllerConfig {
    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(Error::config("cache sync timeout must be positive"));
        }
        if self.resync_period.is_some_and(|p| p.is_zero()) {
            return Err(Error::config("resync period must be positive"));
        }
        if !(1..=65535).contains(&self.service_port.port) {
            return Err(Error::config(format!(
                "service port {} out of range",
                self.service_port.port
            )));
        }
        if self.service_port.name.is_empty() {
            return Err(Error::config("service port name must not be empty"));
        }
        if self.namespace.as_deref().is_some_and(str::is_empty) {
            return Err(Error::config("namespace must not be empty"));
        }
        Ok(())
    }
}
