//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKPRESSURE_PAUSES_TOTAL, BATCH_SIZE, CIRCUIT_BREAKER_STATE, DEAD_LETTERS_TOTAL,
    DELIVERY_ATTEMPTS_TOTAL, DELIVERY_IN_FLIGHT, DELIVERY_LATENCY, HEARTBEATS_PUBLISHED_TOTAL,
    NOTIFICATIONS_DELIVERED_TOTAL, OFFSET_COMMITS_TOTAL, PARTITIONS_ASSIGNED, PARTITIONS_HALTED,
    PENDING_DEPTH, REBALANCES_TOTAL, RECORDS_CONSUMED_TOTAL, RECORDS_PROCESSED_TOTAL,
    RECORD_PROCESSING_LATENCY, REDELIVERIES_TOTAL, RETENTION_DURATION, RETENTION_PURGED_TOTAL,
    RETENTION_RUNS_TOTAL, STORE_ERRORS_TOTAL, STORE_OPERATION_LATENCY, STORE_UPSERTS_TOTAL,
};
use crate::resilience::CircuitState;

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording consumer metrics
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    pub fn record_batch(channel: &str, size: usize) {
        RECORDS_CONSUMED_TOTAL
            .with_label_values(&[channel])
            .inc_by(size as u64);
        BATCH_SIZE.observe(size as f64);
    }

    /// Record the outcome of one record (persisted, duplicate, dead_lettered, ...)
    pub fn record_outcome(outcome: &str, latency_secs: f64) {
        RECORDS_PROCESSED_TOTAL.with_label_values(&[outcome]).inc();
        RECORD_PROCESSING_LATENCY.observe(latency_secs);
    }

    pub fn record_commit() {
        OFFSET_COMMITS_TOTAL.inc();
    }

    pub fn partition_assigned() {
        PARTITIONS_ASSIGNED.inc();
    }

    pub fn partition_released() {
        PARTITIONS_ASSIGNED.dec();
    }

    pub fn partition_halted() {
        PARTITIONS_HALTED.inc();
    }

    pub fn partition_resumed() {
        PARTITIONS_HALTED.dec();
    }

    pub fn record_rebalance() {
        REBALANCES_TOTAL.inc();
    }

    pub fn set_pending_depth(depth: usize) {
        PENDING_DEPTH.set(depth as i64);
    }

    pub fn record_pause() {
        BACKPRESSURE_PAUSES_TOTAL.inc();
    }
}

/// Helper struct for recording store metrics
pub struct StoreMetrics;

impl StoreMetrics {
    pub fn record_latency(backend: &str, operation: &str, latency_secs: f64) {
        STORE_OPERATION_LATENCY
            .with_label_values(&[backend, operation])
            .observe(latency_secs);
    }

    pub fn record_error(backend: &str, operation: &str) {
        STORE_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }

    pub fn record_upsert(outcome: &str) {
        STORE_UPSERTS_TOTAL.with_label_values(&[outcome]).inc();
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_success(kind: &str, latency_secs: f64) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        NOTIFICATIONS_DELIVERED_TOTAL.with_label_values(&[kind]).inc();
        DELIVERY_LATENCY.observe(latency_secs);
    }

    /// `result` is `failure` or `timeout`
    pub fn record_failure(result: &str) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn record_dead_letter(reason: &str) {
        DEAD_LETTERS_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn set_in_flight(count: usize) {
        DELIVERY_IN_FLIGHT.set(count as i64);
    }

    pub fn record_redeliveries(count: usize) {
        REDELIVERIES_TOTAL.inc_by(count as u64);
    }
}

/// Helper struct for recording retention metrics
pub struct RetentionMetrics;

impl RetentionMetrics {
    pub fn record_sweep(purged: u64, duration_secs: f64) {
        RETENTION_PURGED_TOTAL.inc_by(purged);
        RETENTION_RUNS_TOTAL.with_label_values(&["success"]).inc();
        RETENTION_DURATION.observe(duration_secs);
    }

    pub fn record_failure() {
        RETENTION_RUNS_TOTAL.with_label_values(&["failure"]).inc();
    }
}

/// Helper struct for dependency health metrics
pub struct HealthMetrics;

impl HealthMetrics {
    pub fn set_circuit_state(dependency: &str, state: CircuitState) {
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[dependency])
            .set(state.as_gauge());
    }

    pub fn record_heartbeat() {
        HEARTBEATS_PUBLISHED_TOTAL.inc();
    }
}
