//! Kubernetes client construction
//!
//! The controller prefers an explicit kubeconfig file and falls back to the
//! in-cluster service-account configuration when that file cannot be read.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, warn};

use crate::Error;

/// Default connection timeout for kube clients (5s is plenty for local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
///
/// Watch requests are bounded below this by the change feed.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client with default timeouts
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client with custom timeouts
///
/// Uses `kubeconfig` if it can be read, otherwise the in-cluster
/// configuration. Fails only if neither source yields a usable client.
pub async fn create_client_with_timeout(
    kubeconfig: &Path,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match Kubeconfig::read_from(kubeconfig) {
        Ok(kubeconfig_data) => {
            debug!(path = %kubeconfig.display(), "loading kubeconfig");
            Config::from_custom_kubeconfig(kubeconfig_data, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        Err(e) => {
            warn!(
                path = %kubeconfig.display(),
                error = %e,
                "kubeconfig not readable, using in-cluster configuration"
            );
            Config::incluster().map_err(|e| {
                Error::config(format!("failed to load in-cluster config: {}", e))
            })?
        }
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config)
        .map_err(|e| Error::config(format!("failed to create client: {}", e)))
}
