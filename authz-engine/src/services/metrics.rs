//! Prometheus metrics for authz-engine.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Decisions by ownership template and outcome.
pub static DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_decisions_total",
        "Total number of authorization decisions",
        &["template", "operation", "outcome"]
    )
    .expect("Failed to register decisions_total")
});

/// Audit entries appended, by operation.
pub static AUDIT_ENTRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_audit_entries_total",
        "Total number of audit entries recorded",
        &["operation"]
    )
    .expect("Failed to register audit_entries_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_errors_total",
        "Total number of errors by type",
        &["error_type"]  // misconfigured, store_unavailable, parent_unresolvable, ...
    )
    .expect("Failed to register errors_total")
});

/// Restricted accessor invocations.
pub static ACCESSOR_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "authz_accessor_calls_total",
        "Total number of restricted accessor invocations",
        &["accessor", "outcome"]
    )
    .expect("Failed to register accessor_calls_total")
});

/// Store operation duration histogram.
pub static STORE_OP_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "authz_store_op_duration_seconds",
        "Store operation duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register store_op_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DECISIONS_TOTAL);
    Lazy::force(&AUDIT_ENTRIES_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&ACCESSOR_CALLS_TOTAL);
    Lazy::force(&STORE_OP_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
