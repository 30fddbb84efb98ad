//! Metrics registry for netsek observability
//!
//! Provides OpenTelemetry metrics for:
//! - Reconciliation outcomes and latency
//! - Keys dropped after exhausting their retries
//! - Create/replace/delete calls against derived objects
//! - Work queue depth
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for netsek metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("netsek"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Counter of reconciliations by outcome
///
/// Labels:
/// - `result`: converged, retry, fatal
pub static RECONCILE_TOTAL: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("netsek_reconcile_total")
        .with_description("Total number of workload reconciliations by result")
        .with_unit("{reconciliations}")
        .build()
});

/// Histogram of reconciliation duration
///
/// Labels:
/// - `branch`: sync, delete
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("netsek_reconcile_duration_seconds")
        .with_description("Duration of workload reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of keys dropped from the queue without converging
///
/// Labels:
/// - `reason`: max_retries, fatal
pub static ITEMS_DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("netsek_items_dropped_total")
        .with_description("Total number of workload keys dropped without converging")
        .with_unit("{items}")
        .build()
});

// ============================================================================
// Derived Object Metrics
// ============================================================================

/// Counter of API calls against derived objects
///
/// Labels:
/// - `kind`: NetworkPolicy, Service
/// - `operation`: create, replace, delete
/// - `result`: success, not_found, already_exists, error
pub static DERIVED_OPERATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("netsek_derived_operations_total")
        .with_description("Total number of create/replace/delete calls on derived objects")
        .with_unit("{operations}")
        .build()
});

// ============================================================================
// Work Queue Metrics
// ============================================================================

/// Gauge of keys waiting for a worker
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("netsek_queue_depth")
        .with_description("Number of workload keys waiting for a worker")
        .with_unit("{items}")
        .build()
});

/// Label value describing the result of an API call
pub fn operation_result<T>(result: &crate::Result<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) if e.is_not_found() => "not_found",
        Err(e) if e.is_already_exists() => "already_exists",
        Err(_) => "error",
    }
}
