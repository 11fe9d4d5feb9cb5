//! Metrics module for recurrent-billing.
//! Provides Prometheus metrics for charge runs and status transitions.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram, register_histogram_vec, register_int_counter_vec,
    Encoder, Histogram, HistogramVec, IntCounterVec, TextEncoder,
};

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "recurrent_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Outcome of each processed charge attempt
pub static CHARGE_OUTCOMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "recurrent_charge_outcomes_total",
            "Processed recurrent charge attempts by outcome"
        ),
        &["outcome"]
    )
    .expect("Failed to register CHARGE_OUTCOMES_TOTAL")
});

/// Payment status transition requests by result (updated / skipped / rejected)
pub static STATUS_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "recurrent_status_transitions_total",
            "Payment status transition requests by target status and result"
        ),
        &["to", "result"]
    )
    .expect("Failed to register STATUS_TRANSITIONS_TOTAL")
});

/// Time spent waiting on advisory locks
pub static LOCK_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "recurrent_lock_wait_seconds",
        "Time spent acquiring advisory locks"
    ))
    .expect("Failed to register LOCK_WAIT_SECONDS")
});

/// Orchestrator runs by final status
pub static RUNS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("recurrent_runs_total", "Recurrent charge runs by status"),
        &["status"]
    )
    .expect("Failed to register RUNS_TOTAL")
});

/// Error counter for alerting
pub static ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("recurrent_errors_total", "Total errors by type for alerting"),
        &["error_type", "operation"]
    )
    .expect("Failed to register ERRORS_TOTAL")
});

/// Force registration of all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&CHARGE_OUTCOMES_TOTAL);
    Lazy::force(&STATUS_TRANSITIONS_TOTAL);
    Lazy::force(&LOCK_WAIT_SECONDS);
    Lazy::force(&RUNS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
}

pub fn record_charge_outcome(outcome: &str) {
    CHARGE_OUTCOMES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_status_transition(to: &str, result: &str) {
    STATUS_TRANSITIONS_TOTAL.with_label_values(&[to, result]).inc();
}

pub fn record_lock_wait(seconds: f64) {
    LOCK_WAIT_SECONDS.observe(seconds);
}

pub fn record_run(status: &str) {
    RUNS_TOTAL.with_label_values(&[status]).inc();
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type, operation]).inc();
}

/// Render all registered metrics in the Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
