//! Prometheus metrics for ledger-sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration by operation.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ledger_sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for sync jobs by trigger reason and outcome.
pub static SYNC_JOBS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_jobs_total",
        "Total number of connection sync jobs",
        &["reason", "outcome"]
    )
    .expect("Failed to register SYNC_JOBS")
});

/// Counter for matching outcomes by rule.
pub static MATCH_OUTCOMES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_match_outcomes_total",
        "Matching engine outcomes",
        &["outcome", "rule"]
    )
    .expect("Failed to register MATCH_OUTCOMES")
});

/// Counter for consistency anomalies by kind.
pub static ANOMALIES_DETECTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_anomalies_total",
        "Anomalies reported by the consistency checker",
        &["kind"]
    )
    .expect("Failed to register ANOMALIES_DETECTED")
});

/// Counter for token refresh attempts by outcome.
pub static TOKEN_REFRESHES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_token_refreshes_total",
        "Token vault refresh exchanges",
        &["outcome"]
    )
    .expect("Failed to register TOKEN_REFRESHES")
});

/// Counter for ingested source records by source type and status.
pub static RECORDS_INGESTED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "ledger_sync_records_ingested_total",
        "Source records ingested",
        &["source_type", "status"]
    )
    .expect("Failed to register RECORDS_INGESTED")
});

/// Force registration of all metrics at startup.
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&SYNC_JOBS);
    Lazy::force(&MATCH_OUTCOMES);
    Lazy::force(&ANOMALIES_DETECTED);
    Lazy::force(&TOKEN_REFRESHES);
    Lazy::force(&RECORDS_INGESTED);
}

/// Gather all registered metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
