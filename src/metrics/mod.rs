//! Prometheus metrics for the notification pipeline.
//!
//! - Consumer metrics (records by outcome, batches, commits, halted partitions)
//! - Store metrics (operation latency and errors per backend)
//! - Delivery metrics (attempts, dead letters, latency)
//! - Retention metrics (purged records, sweep duration)

mod helpers;

pub use helpers::{
    encode_metrics, ConsumerMetrics, DeliveryMetrics, HealthMetrics, RetentionMetrics,
    StoreMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_pipeline";

lazy_static! {
    // ============================================================================
    // Consumer Metrics
    // ============================================================================

    /// Records fetched from the broker, by channel
    pub static ref RECORDS_CONSUMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_records_consumed_total", METRIC_PREFIX),
        "Total records fetched from the broker",
        &["channel"]
    ).unwrap();

    /// Final outcome of each processed record
    pub static ref RECORDS_PROCESSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_records_processed_total", METRIC_PREFIX),
        "Total records processed by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref RECORD_PROCESSING_LATENCY: Histogram = register_histogram!(
        format!("{}_record_processing_seconds", METRIC_PREFIX),
        "Time from fetch to persisted for one record",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref BATCH_SIZE: Histogram = register_histogram!(
        format!("{}_batch_size", METRIC_PREFIX),
        "Records per fetched batch",
        vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]
    ).unwrap();

    pub static ref OFFSET_COMMITS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_offset_commits_total", METRIC_PREFIX),
        "Total committed partition offsets"
    ).unwrap();

    pub static ref PARTITIONS_ASSIGNED: IntGauge = register_int_gauge!(
        format!("{}_partitions_assigned", METRIC_PREFIX),
        "Partitions currently owned by a member"
    ).unwrap();

    /// Partitions stopped on a persistent store failure
    pub static ref PARTITIONS_HALTED: IntGauge = register_int_gauge!(
        format!("{}_partitions_halted", METRIC_PREFIX),
        "Partitions halted on a persistent store failure"
    ).unwrap();

    pub static ref REBALANCES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_rebalances_total", METRIC_PREFIX),
        "Total cooperative rebalances"
    ).unwrap();

    /// Records in persistence plus notifications waiting for dispatch
    pub static ref PENDING_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_pending_depth", METRIC_PREFIX),
        "Downstream pending depth seen by the consumer"
    ).unwrap();

    pub static ref BACKPRESSURE_PAUSES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_backpressure_pauses_total", METRIC_PREFIX),
        "Times consumption paused on downstream backpressure"
    ).unwrap();

    // ============================================================================
    // Store Metrics
    // ============================================================================

    pub static ref STORE_OPERATION_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_store_operation_seconds", METRIC_PREFIX),
        "Notification store operation latency",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Notification store errors",
        &["backend", "operation"]
    ).unwrap();

    pub static ref STORE_UPSERTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_store_upserts_total", METRIC_PREFIX),
        "Upserts by outcome (inserted or existing)",
        &["outcome"]
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_attempts_total", METRIC_PREFIX),
        "Delivery attempts by result",
        &["result"]
    ).unwrap();

    pub static ref NOTIFICATIONS_DELIVERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_notifications_delivered_total", METRIC_PREFIX),
        "Notifications delivered, by kind",
        &["kind"]
    ).unwrap();

    pub static ref DEAD_LETTERS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dead_letters_total", METRIC_PREFIX),
        "Records and notifications sent to the dead letter channel",
        &["reason"]
    ).unwrap();

    pub static ref DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_delivery_seconds", METRIC_PREFIX),
        "Latency of a single channel send",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref DELIVERY_IN_FLIGHT: IntGauge = register_int_gauge!(
        format!("{}_delivery_in_flight", METRIC_PREFIX),
        "Notifications queued or being delivered"
    ).unwrap();

    pub static ref REDELIVERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_redeliveries_total", METRIC_PREFIX),
        "Undelivered notifications resubmitted by the scanner"
    ).unwrap();

    // ============================================================================
    // Retention Metrics
    // ============================================================================

    pub static ref RETENTION_PURGED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_retention_purged_total", METRIC_PREFIX),
        "Expired notifications removed"
    ).unwrap();

    pub static ref RETENTION_RUNS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_retention_runs_total", METRIC_PREFIX),
        "Retention sweeps by result",
        &["result"]
    ).unwrap();

    pub static ref RETENTION_DURATION: Histogram = register_histogram!(
        format!("{}_retention_sweep_seconds", METRIC_PREFIX),
        "Duration of one retention sweep",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Dependency Health Metrics
    // ============================================================================

    /// Circuit breaker state (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Circuit breaker state per dependency",
        &["dependency"]
    ).unwrap();

    pub static ref HEARTBEATS_PUBLISHED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeats_published_total", METRIC_PREFIX),
        "System health heartbeats published"
    ).unwrap();
}
