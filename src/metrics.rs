/// Metrics and telemetry for the server key service
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - Key lookups per tier (cache, store, fetcher) and outcome
/// - Fetcher success/failure counts and latencies
/// - Unresolved and stored key counts
/// - Internal API request counts

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ========== Resolution Metrics ==========

    /// Key lookups by tier and outcome (hit, miss, stale)
    pub static ref KEY_LOOKUPS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "server_key_lookups_total",
        "Total number of server key lookups by tier and outcome",
        &["source", "outcome"]
    )
    .unwrap();

    /// Fetcher invocations by fetcher name and status
    pub static ref KEY_FETCHER_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "server_key_fetcher_requests_total",
        "Total number of key fetcher invocations",
        &["fetcher", "status"]
    )
    .unwrap();

    /// Fetcher latency in seconds
    pub static ref KEY_FETCHER_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "server_key_fetcher_duration_seconds",
        "Key fetcher latencies in seconds",
        &["fetcher"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Keys that no tier could resolve
    pub static ref KEYS_UNRESOLVED_TOTAL: IntCounter = register_int_counter!(
        "server_keys_unresolved_total",
        "Total number of requested server keys left unresolved"
    )
    .unwrap();

    /// Keys written to the key database
    pub static ref KEYS_STORED_TOTAL: IntCounter = register_int_counter!(
        "server_keys_stored_total",
        "Total number of server keys written to the key database"
    )
    .unwrap();

    // ========== Internal API Metrics ==========

    /// Internal API requests by operation and status
    pub static ref INTERNAL_API_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "server_key_api_requests_total",
        "Total number of internal key API requests",
        &["operation", "status"]
    )
    .unwrap();
}

/// Render all registered metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record lookups answered (or not) by one tier
pub fn record_key_lookups(source: &str, outcome: &str, count: usize) {
    if count == 0 {
        return;
    }
    KEY_LOOKUPS_TOTAL
        .with_label_values(&[source, outcome])
        .inc_by(count as u64);
}

/// Record a fetcher invocation
pub fn record_fetcher_request(fetcher: &str, success: bool, duration: f64) {
    KEY_FETCHER_REQUESTS_TOTAL
        .with_label_values(&[fetcher, if success { "success" } else { "failure" }])
        .inc();
    KEY_FETCHER_DURATION_SECONDS
        .with_label_values(&[fetcher])
        .observe(duration);
}

/// Record identifiers left unresolved after every tier
pub fn record_unresolved_keys(count: usize) {
    KEYS_UNRESOLVED_TOTAL.inc_by(count as u64);
}

/// Record keys written to the key database
pub fn record_keys_stored(count: usize) {
    KEYS_STORED_TOTAL.inc_by(count as u64);
}

/// Record an internal API request
pub fn record_api_request(operation: &str, status: &str) {
    INTERNAL_API_REQUESTS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}
