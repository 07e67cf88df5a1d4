//! Metrics for the shard query core
//!
//! Prometheus collectors for query outcomes, shard fan-out, cache behavior
//! and merge volume.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, Encoder,
    HistogramVec, IntCounter, TextEncoder,
};

lazy_static! {
    // === Queries ===

    /// Evaluations by operator and outcome
    pub static ref QUERIES_TOTAL: CounterVec = register_counter_vec!(
        "shardquery_queries_total",
        "Total evaluations",
        &["operator", "status"]
    ).unwrap();

    /// Evaluation latency
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "shardquery_query_duration_seconds",
        "Evaluation latency in seconds",
        &["operator"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // === Shard fan-out ===

    /// Shard requests by outcome
    pub static ref SHARD_TASKS_TOTAL: CounterVec = register_counter_vec!(
        "shardquery_shard_tasks_total",
        "Total per-shard search requests",
        &["status"]
    ).unwrap();

    /// Shard request latency
    pub static ref SHARD_TASK_DURATION: HistogramVec = register_histogram_vec!(
        "shardquery_shard_task_duration_seconds",
        "Per-shard search request latency in seconds",
        &["status"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // === Caches ===

    /// Series identity cache outcomes (hit, incremental, full, bypass)
    pub static ref TSID_CACHE_TOTAL: CounterVec = register_counter_vec!(
        "shardquery_tsid_cache_total",
        "Series identity cache resolutions by outcome",
        &["outcome"]
    ).unwrap();

    /// Shard metadata refreshes by outcome
    pub static ref SHARD_REFRESH_TOTAL: CounterVec = register_counter_vec!(
        "shardquery_shard_refresh_total",
        "Shard metadata loads by outcome",
        &["status"]
    ).unwrap();

    // === Merge ===

    /// Series produced by the merge engines
    pub static ref MERGED_SERIES_TOTAL: IntCounter = register_int_counter!(
        "shardquery_merged_series_total",
        "Total series emitted by the merge engines"
    ).unwrap();
}

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "error"
    }
}

/// Get metrics in Prometheus text format
pub fn gather_text() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record one evaluation
#[inline]
pub fn record_query(operator: &str, duration_secs: f64, success: bool) {
    QUERIES_TOTAL.with_label_values(&[operator, status(success)]).inc();
    QUERY_DURATION.with_label_values(&[operator]).observe(duration_secs);
}

/// Record one shard request
#[inline]
pub fn record_shard_task(duration_secs: f64, success: bool) {
    SHARD_TASKS_TOTAL.with_label_values(&[status(success)]).inc();
    SHARD_TASK_DURATION
        .with_label_values(&[status(success)])
        .observe(duration_secs);
}

/// Record a series identity cache resolution
#[inline]
pub fn record_tsid_cache(outcome: &str) {
    TSID_CACHE_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a shard metadata load
#[inline]
pub fn record_shard_refresh(success: bool) {
    SHARD_REFRESH_TOTAL.with_label_values(&[status(success)]).inc();
}

/// Record merged series
#[inline]
pub fn record_merged_series(count: usize) {
    MERGED_SERIES_TOTAL.inc_by(count as u64);
}
