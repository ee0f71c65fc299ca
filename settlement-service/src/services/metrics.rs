//! Metrics module for settlement-service.
//! Provides Prometheus metrics for message intake, settlement, invoicing
//! and payment matching.

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
            "settlement_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Inbound messages processed counter
pub static MESSAGES_PROCESSED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound messages dead-lettered counter
pub static MESSAGES_DEAD_LETTERED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound messages failed counter
pub static MESSAGES_FAILED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Message processing duration histogram
pub static MESSAGE_PROCESSING_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Settlement runs counter by status
pub static SETTLEMENT_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Correction batches created counter
pub static CORRECTIONS_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Invoices created counter
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment allocations counter
pub static PAYMENTS_ALLOCATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Allocated payment amount counter (monetary tracking)
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    MESSAGES_PROCESSED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_messages_processed_total",
                "Total inbound messages processed by queue"
            ),
            &["queue"]
        )
        .expect("Failed to register MESSAGES_PROCESSED_TOTAL")
    });

    MESSAGES_DEAD_LETTERED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_messages_dead_lettered_total",
                "Total inbound messages dead-lettered by queue"
            ),
            &["queue"]
        )
        .expect("Failed to register MESSAGES_DEAD_LETTERED_TOTAL")
    });

    MESSAGES_FAILED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_messages_failed_total",
                "Total inbound messages that failed and will be retried"
            ),
            &["queue"]
        )
        .expect("Failed to register MESSAGES_FAILED_TOTAL")
    });

    // Custom buckets: timeseries messages fan out into settlement runs and
    // can take seconds.
    MESSAGE_PROCESSING_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "settlement_message_processing_duration_seconds",
                "Inbound message processing duration",
                vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &["queue"]
        )
        .expect("Failed to register MESSAGE_PROCESSING_DURATION")
    });

    SETTLEMENT_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_runs_total",
                "Total settlement runs by status"
            ),
            &["status"]
        )
        .expect("Failed to register SETTLEMENT_RUNS_TOTAL")
    });

    CORRECTIONS_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_corrections_created_total",
                "Total correction batches created by trigger type"
            ),
            &["trigger_type"]
        )
        .expect("Failed to register CORRECTIONS_CREATED_TOTAL")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_invoices_created_total",
                "Total invoices created by billing frequency"
            ),
            &["billing_frequency"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    PAYMENTS_ALLOCATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "settlement_payments_allocated_total",
                "Total payment allocations by method"
            ),
            &["method"]
        )
        .expect("Failed to register PAYMENTS_ALLOCATED_TOTAL")
    });

    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "settlement_payment_amount_total",
                "Total allocated payment amount by method"
            ),
            &["method"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a processed inbound message.
pub fn record_message_processed(queue: &str) {
    if let Some(counter) = MESSAGES_PROCESSED_TOTAL.get() {
        counter.with_label_values(&[queue]).inc();
    }
}

/// Record a dead-lettered inbound message.
pub fn record_message_dead_lettered(queue: &str) {
    if let Some(counter) = MESSAGES_DEAD_LETTERED_TOTAL.get() {
        counter.with_label_values(&[queue]).inc();
    }
}

/// Record a failed inbound message.
pub fn record_message_failed(queue: &str) {
    if let Some(counter) = MESSAGES_FAILED_TOTAL.get() {
        counter.with_label_values(&[queue]).inc();
    }
}

/// Record message processing duration.
pub fn record_message_duration(queue: &str, duration_secs: f64) {
    if let Some(histogram) = MESSAGE_PROCESSING_DURATION.get() {
        histogram.with_label_values(&[queue]).observe(duration_secs);
    }
}

/// Record a settlement run outcome.
pub fn record_settlement_run(status: &str) {
    if let Some(counter) = SETTLEMENT_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record a correction batch created.
pub fn record_correction_created(trigger_type: &str) {
    if let Some(counter) = CORRECTIONS_CREATED_TOTAL.get() {
        counter.with_label_values(&[trigger_type]).inc();
    }
}

/// Record an invoice created.
pub fn record_invoice_created(billing_frequency: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[billing_frequency]).inc();
    }
}

/// Record a payment allocation.
pub fn record_payment_allocated(method: &str, amount: f64) {
    if let Some(counter) = PAYMENTS_ALLOCATED_TOTAL.get() {
        counter.with_label_values(&[method]).inc();
    }
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter.with_label_values(&[method]).inc_by(amount.abs());
    }
}
