//! Metrics module for subscription-service.
//! Provides Prometheus metrics for the ledger, the weekly sweep and notification delivery.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "subscription_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Balance mutations by operation
pub static BALANCE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription lifecycle operations
pub static SUBSCRIPTION_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Completed sweeps by status
pub static SWEEP_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-account charge outcomes inside a sweep
pub static CHARGES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Insufficient-funds notifications by outcome
pub static NOTIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Current billing week
pub static BILLING_WEEK: OnceLock<IntGauge> = OnceLock::new();

/// gRPC request counter
pub static GRPC_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request duration histogram
pub static GRPC_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Safe to call more than once.
pub fn init_metrics() {
    BALANCE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_balance_operations_total",
                "Balance mutations by operation and outcome"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register BALANCE_OPERATIONS_TOTAL")
    });

    SUBSCRIPTION_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_operations_total",
                "Subscription lifecycle operations"
            ),
            &["operation"]
        )
        .expect("Failed to register SUBSCRIPTION_OPERATIONS_TOTAL")
    });

    SWEEP_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_sweep_runs_total", "Weekly charge sweeps by status"),
            &["status"]
        )
        .expect("Failed to register SWEEP_RUNS_TOTAL")
    });

    CHARGES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_charges_total",
                "Per-account charge outcomes during sweeps"
            ),
            &["outcome"]
        )
        .expect("Failed to register CHARGES_TOTAL")
    });

    NOTIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "subscription_notifications_total",
                "Insufficient-funds notifications by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register NOTIFICATIONS_TOTAL")
    });

    BILLING_WEEK.get_or_init(|| {
        register_int_gauge!(opts!("subscription_billing_week", "Current billing week number"))
            .expect("Failed to register BILLING_WEEK")
    });

    GRPC_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_grpc_requests_total", "Total gRPC requests"),
            &["method", "status"]
        )
        .expect("Failed to register GRPC_REQUESTS_TOTAL")
    });

    GRPC_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "subscription_grpc_request_duration_seconds",
                "gRPC request duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            ),
            &["method"]
        )
        .expect("Failed to register GRPC_REQUEST_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("subscription_errors_total", "Total errors by type for alerting"),
            &["error_type", "method"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
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

pub fn record_balance_operation(operation: &str, outcome: &str) {
    if let Some(counter) = BALANCE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn record_subscription_operation(operation: &str) {
    if let Some(counter) = SUBSCRIPTION_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_sweep_run(status: &str) {
    if let Some(counter) = SWEEP_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record one account's charge outcome: charged, insufficient_funds, cancelled or failed.
pub fn record_charge(outcome: &str) {
    if let Some(counter) = CHARGES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a notification outcome: e.g. queued, spilled, published, outboxed.
pub fn record_notification(outcome: &str) {
    if let Some(counter) = NOTIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn set_billing_week(week: u64) {
    if let Some(gauge) = BILLING_WEEK.get() {
        gauge.set(i64::try_from(week).unwrap_or(i64::MAX));
    }
}

/// Record a gRPC request.
pub fn record_grpc_request(method: &str, status: &str) {
    if let Some(counter) = GRPC_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

/// Record gRPC request duration.
pub fn record_grpc_request_duration(method: &str, duration_secs: f64) {
    if let Some(histogram) = GRPC_REQUEST_DURATION.get() {
        histogram
            .with_label_values(&[method])
            .observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, method: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, method]).inc();
    }
}
