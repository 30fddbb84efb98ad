//! netsek - Kubernetes controller for per-workload network isolation
//!
//! netsek watches Deployments and keeps two derived objects alive for each one:
//! a default-deny NetworkPolicy and a Service, both named after the Deployment
//! and both selecting its pod-template labels. When the Deployment goes away,
//! so do the derived objects.
//!
//! # Architecture
//!
//! ```text
//! ChangeFeed -> Dispatcher -> WorkQueue -> Reconciler -> ClusterClient -> API server
//! ```
//!
//! - The change feed mirrors Deployments into a local reflector store and
//!   notifies the dispatcher of adds, updates and deletes.
//! - The dispatcher turns notifications into [`key::WorkloadKey`]s and pushes
//!   them onto the work queue. It never talks to the API server.
//! - The work queue deduplicates keys, keeps at most one in-flight instance
//!   per key and applies rate-limited retries.
//! - Reconciler workers pull keys and converge the derived objects.
//!
//! # Modules
//!
//! - [`controller`] - Wiring of all components and the process stop signal
//! - [`feed`] - Deployment watch, local mirror and notification delivery
//! - [`dispatcher`] - Notification to queue translation
//! - [`queue`] - Deduplicating, rate-limited work queue
//! - [`reconciler`] - Convergence algorithm for one workload key
//! - [`client`] - Cluster API abstraction and its kube implementation
//! - [`resources`] - Builders for the derived NetworkPolicy and Service
//! - [`key`] - Workload keys
//! - [`config`] - Controller configuration
//! - [`kube_utils`] - Client construction with in-cluster fallback
//! - [`telemetry`] / [`metrics`] - Logging, tracing and metrics
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod key;
pub mod kube_utils;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Ownership markers
// =============================================================================

/// Field manager used for server-side apply of derived objects
pub const FIELD_MANAGER: &str = "netsek-controller";

/// Label key marking objects created by this controller
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label value for [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "netsek";

/// Annotation recording which workload a derived object belongs to
pub const WORKLOAD_ANNOTATION: &str = "netsek.io/workload";

/// Kubeconfig location used when none is given on the command line
pub const DEFAULT_KUBECONFIG_PATH: &str = "/root/.kube/config";
