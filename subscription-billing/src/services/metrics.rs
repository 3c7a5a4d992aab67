//! Metrics module for subscription-billing.
//! Provides Prometheus metrics for billing cycles, the fleet scheduler and the
//! downstream invoice pipeline.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Billing cycles by outcome
pub static BILLING_CYCLES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing cycle duration histogram
pub static BILLING_CYCLE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Elapsed periods processed
pub static PERIODS_PROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices materialized, by result (created, recovered, zero_value, failed)
pub static INVOICES_MATERIALIZED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Pause transitions (activate, resume)
pub static PAUSE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscriptions cancelled by the engine
pub static CANCELLATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Scheduler enqueue outcomes
pub static SCHEDULER_ENQUEUES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing runs by type and status
pub static BILLING_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Downstream invoice processing outcomes by step
pub static INVOICE_PROCESSING_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    BILLING_CYCLES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_cycles_total",
                "Total billing cycles by tenant and outcome"
            ),
            &["tenant_id", "outcome"]
        )
        .expect("Failed to register BILLING_CYCLES_TOTAL")
    });

    BILLING_CYCLE_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_cycle_duration_seconds",
                "Billing cycle wall-clock duration",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]
            ),
            &["outcome"]
        )
        .expect("Failed to register BILLING_CYCLE_DURATION")
    });

    PERIODS_PROCESSED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_periods_processed_total",
                "Total elapsed billing periods processed by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register PERIODS_PROCESSED_TOTAL")
    });

    INVOICES_MATERIALIZED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoices_materialized_total",
                "Total period invoices by tenant and result"
            ),
            &["tenant_id", "result"]
        )
        .expect("Failed to register INVOICES_MATERIALIZED_TOTAL")
    });

    PAUSE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_pause_transitions_total",
                "Total pause activations and resumptions by tenant"
            ),
            &["tenant_id", "transition"]
        )
        .expect("Failed to register PAUSE_TRANSITIONS_TOTAL")
    });

    CANCELLATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_cancellations_total",
                "Total subscriptions cancelled at a period boundary"
            ),
            &["tenant_id", "reason"]
        )
        .expect("Failed to register CANCELLATIONS_TOTAL")
    });

    SCHEDULER_ENQUEUES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_scheduler_enqueues_total",
                "Total scheduler enqueue attempts by result"
            ),
            &["result"]
        )
        .expect("Failed to register SCHEDULER_ENQUEUES_TOTAL")
    });

    BILLING_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_runs_total", "Total billing runs by type and status"),
            &["run_type", "status"]
        )
        .expect("Failed to register BILLING_RUNS_TOTAL")
    });

    INVOICE_PROCESSING_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_invoice_processing_total",
                "Total downstream invoice processing steps by result"
            ),
            &["step", "result"]
        )
        .expect("Failed to register INVOICE_PROCESSING_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by kind for alerting"),
            &["error_kind", "operation"]
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

/// Record a finished billing cycle.
pub fn record_billing_cycle(tenant_id: &str, outcome: &str, duration_secs: f64) {
    if let Some(counter) = BILLING_CYCLES_TOTAL.get() {
        counter.with_label_values(&[tenant_id, outcome]).inc();
    }
    if let Some(histogram) = BILLING_CYCLE_DURATION.get() {
        histogram.with_label_values(&[outcome]).observe(duration_secs);
    }
}

/// Record elapsed periods processed in one cycle.
pub fn record_periods_processed(tenant_id: &str, count: u64) {
    if let Some(counter) = PERIODS_PROCESSED_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc_by(count);
    }
}

/// Record a period invoice result.
pub fn record_invoice_materialized(tenant_id: &str, result: &str) {
    if let Some(counter) = INVOICES_MATERIALIZED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, result]).inc();
    }
}

/// Record a pause transition.
pub fn record_pause_transition(tenant_id: &str, transition: &str) {
    if let Some(counter) = PAUSE_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, transition]).inc();
    }
}

/// Record a cancellation.
pub fn record_cancellation(tenant_id: &str, reason: &str) {
    if let Some(counter) = CANCELLATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, reason]).inc();
    }
}

/// Record a scheduler enqueue attempt.
pub fn record_scheduler_enqueue(result: &str) {
    if let Some(counter) = SCHEDULER_ENQUEUES_TOTAL.get() {
        counter.with_label_values(&[result]).inc();
    }
}

/// Record a billing run.
pub fn record_billing_run(run_type: &str, status: &str) {
    if let Some(counter) = BILLING_RUNS_TOTAL.get() {
        counter.with_label_values(&[run_type, status]).inc();
    }
}

/// Record a downstream invoice processing step.
pub fn record_invoice_processing(step: &str, result: &str) {
    if let Some(counter) = INVOICE_PROCESSING_TOTAL.get() {
        counter.with_label_values(&[step, result]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_kind: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_kind, operation]).inc();
    }
}
