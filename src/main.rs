//! netsek - per-workload network isolation controller

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use netsek::client::KubeClusterClient;
use netsek::config::{
    ControllerConfig, DEFAULT_CACHE_SYNC_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_RESYNC_PERIOD,
    DEFAULT_WORKERS,
};
use netsek::resources::ServicePortSpec;
use netsek::telemetry::{init_telemetry, TelemetryConfig};
use netsek::{controller, feed, kube_utils, DEFAULT_KUBECONFIG_PATH};

/// netsek - default-deny NetworkPolicy and Service for every Deployment
#[derive(Parser, Debug)]
#[command(name = "netsek", version, about, long_about = None)]
struct Cli {
    /// Path to a kubeconfig file; the in-cluster configuration is used if it cannot be read
    #[arg(long, env = "KUBECONFIG", default_value = DEFAULT_KUBECONFIG_PATH)]
    kubeconfig: PathBuf,

    /// Only watch workloads in this namespace
    #[arg(long, env = "NETSEK_NAMESPACE")]
    namespace: Option<String>,

    /// Number of reconciler workers
    #[arg(long, env = "NETSEK_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Retries before a failing workload is dropped
    #[arg(long, env = "NETSEK_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Seconds to wait for the initial workload listing
    #[arg(long, default_value_t = DEFAULT_CACHE_SYNC_TIMEOUT.as_secs())]
    cache_sync_timeout_secs: u64,

    /// Seconds between full resyncs of cached workloads (0 disables)
    #[arg(long, default_value_t = DEFAULT_RESYNC_PERIOD.as_secs())]
    resync_period_secs: u64,

    /// Port exposed by every derived Service
    #[arg(long, default_value_t = 80)]
    service_port: i32,

    /// Name of the port exposed by every derived Service
    #[arg(long, default_value = "http")]
    service_port_name: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "NETSEK_JSON_LOGS")]
    json_logs: bool,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            resync_period: (self.resync_period_secs > 0)
                .then(|| Duration::from_secs(self.resync_period_secs)),
            namespace: self.namespace.clone(),
            service_port: ServicePortSpec {
                name: self.service_port_name.clone(),
                port: self.service_port,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS connection is made
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json_logs: cli.json_logs,
        ..Default::default()
    })
    .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let config = cli.controller_config();
    let client = kube_utils::create_client(&cli.kubeconfig)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    info!(
        namespace = config.namespace.as_deref().unwrap_or("<all>"),
        workers = config.workers,
        "starting netsek controller"
    );

    let events = feed::workload_watch(client.clone(), config.namespace.as_deref());
    controller::run(
        Arc::new(KubeClusterClient::new(client)),
        events,
        config,
        shutdown,
    )
    .await
    .map_err(|e| anyhow::anyhow!("Controller failed: {}", e))
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
