// src/metrics.rs

//! # Global Metrics Registry
//!
//! Defines and registers every Prometheus metric the indexer exports.
//! Centralizing the definitions keeps metric names and label sets
//! consistent and gives one place to audit the observability surface.
//!
//! Modules record through the thin helper functions at the bottom instead
//! of touching the statics, so label vocabularies stay closed.

use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec, register_int_gauge, register_int_gauge_vec, Encoder, Gauge,
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};
use std::time::Duration;

use crate::types::{CircuitState, IndexerMode};

// --- RPC Metrics ---

pub static RPC_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_calls_total",
        "RPC calls issued, labeled by method, endpoint and outcome.",
        &["method", "endpoint", "outcome"]
    ).expect("Failed to register rpc_calls_total")
});
pub static RPC_CALL_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "rpc_call_latency_seconds",
        "RPC call latency in seconds, labeled by method.",
        &["method"]
    ).expect("Failed to register rpc_call_latency_seconds")
});
pub static RPC_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "rpc_call_retries_total",
        "Number of RPC retry passes, labeled by method.",
        &["method"]
    ).expect("Failed to register rpc_call_retries_total")
});
pub static ENDPOINT_CIRCUIT_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "indexer_endpoint_circuit_state",
        "Circuit state per endpoint (0=CLOSED, 1=HALF_OPEN, 2=OPEN).",
        &["endpoint"]
    ).expect("Failed to register indexer_endpoint_circuit_state")
});

// --- Scanner Metrics ---

pub static EVENTS_SCANNED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "indexer_events_scanned_total",
        "Decoded, receipt-validated events produced by the scanner.",
        &["event_kind"]
    ).expect("Failed to register indexer_events_scanned_total")
});
pub static LOGS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "indexer_logs_dropped_total",
        "Logs discarded before persistence, labeled by reason.",
        &["event_kind", "reason"]
    ).expect("Failed to register indexer_logs_dropped_total")
});
pub static RANGE_HALVINGS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "indexer_range_halvings_total",
        "Times a scan range was split after a provider size rejection."
    ).expect("Failed to register indexer_range_halvings_total")
});
pub static RECEIPT_CACHE: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "indexer_receipt_cache_total",
        "Receipt status cache lookups, labeled hit or miss.",
        &["result"]
    ).expect("Failed to register indexer_receipt_cache_total")
});
pub static SCAN_WINDOWS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "indexer_scan_windows_total",
        "Scan windows processed, labeled by outcome.",
        &["outcome"]
    ).expect("Failed to register indexer_scan_windows_total")
});
pub static SCAN_WINDOW_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "indexer_scan_window_duration_seconds",
        "End-to-end duration of one scan-persist-checkpoint cycle."
    ).expect("Failed to register indexer_scan_window_duration_seconds")
});

// --- Persistence Metrics ---

pub static EVENTS_PERSISTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "indexer_events_persisted_total",
        "Event rows newly written to the database."
    ).expect("Failed to register indexer_events_persisted_total")
});
pub static EVENTS_DEDUPLICATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "indexer_events_deduplicated_total",
        "Events skipped by the natural-key conflict clause on replay."
    ).expect("Failed to register indexer_events_deduplicated_total")
});

// --- Progress & Lag Metrics ---

pub static LAST_INDEXED_BLOCK: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "indexer_last_indexed_block",
        "Highest block committed to the checkpoint."
    ).expect("Failed to register indexer_last_indexed_block")
});
pub static CHAIN_HEAD: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "indexer_chain_head_block",
        "Most recently observed chain head."
    ).expect("Failed to register indexer_chain_head_block")
});
pub static LAG_BLOCKS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "indexer_lag_blocks",
        "Blocks between the chain head and the checkpoint."
    ).expect("Failed to register indexer_lag_blocks")
});
pub static INDEXING_RATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "indexer_blocks_per_second",
        "Smoothed indexing throughput over the sample window."
    ).expect("Failed to register indexer_blocks_per_second")
});
pub static EMERGENCY_MODE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "indexer_emergency_mode",
        "1 while the indexer is in EMERGENCY mode, 0 otherwise."
    ).expect("Failed to register indexer_emergency_mode")
});
pub static LAG_CRITICAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "indexer_lag_critical",
        "1 while lag is at or above the critical threshold."
    ).expect("Failed to register indexer_lag_critical")
});
pub static SKIPPED_BLOCKS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "indexer_skipped_blocks_total",
        "Blocks abandoned by skip-to-recent catch-up."
    ).expect("Failed to register indexer_skipped_blocks_total")
});

// --- Recording Helpers ---

pub fn observe_rpc_call(method: &str, endpoint: &str, outcome: &str, elapsed: Duration) {
    RPC_CALLS.with_label_values(&[method, endpoint, outcome]).inc();
    RPC_CALL_LATENCY
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn inc_rpc_retry(method: &str) {
    RPC_RETRIES.with_label_values(&[method]).inc();
}

pub fn set_circuit_state(endpoint: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    };
    ENDPOINT_CIRCUIT_STATE.with_label_values(&[endpoint]).set(value);
}

pub fn add_events_scanned(event_kind: &str, count: u64) {
    EVENTS_SCANNED.with_label_values(&[event_kind]).inc_by(count);
}

pub fn inc_dropped_log(event_kind: &str, reason: &str) {
    LOGS_DROPPED.with_label_values(&[event_kind, reason]).inc();
}

pub fn inc_range_halving() {
    RANGE_HALVINGS.inc();
}

pub fn inc_receipt_cache(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    RECEIPT_CACHE.with_label_values(&[result]).inc();
}

pub fn observe_window(outcome: &str, elapsed: Duration) {
    SCAN_WINDOWS.with_label_values(&[outcome]).inc();
    SCAN_WINDOW_DURATION.observe(elapsed.as_secs_f64());
}

pub fn add_events_persisted(written: u64, duplicates: u64) {
    EVENTS_PERSISTED.inc_by(written);
    EVENTS_DEDUPLICATED.inc_by(duplicates);
}

pub fn set_last_indexed_block(block: u64) {
    LAST_INDEXED_BLOCK.set(block as i64);
}

pub fn set_chain_head(block: u64) {
    CHAIN_HEAD.set(block as i64);
}

pub fn set_lag_blocks(lag: u64) {
    LAG_BLOCKS.set(lag as i64);
}

pub fn set_indexing_rate(blocks_per_sec: f64) {
    INDEXING_RATE.set(blocks_per_sec);
}

pub fn set_mode(mode: IndexerMode) {
    EMERGENCY_MODE.set(matches!(mode, IndexerMode::Emergency) as i64);
}

pub fn set_critical_lag(active: bool) {
    LAG_CRITICAL.set(active as i64);
}

pub fn add_skipped_blocks(count: u64) {
    SKIPPED_BLOCKS.inc_by(count);
}

/// Gathers every registered metric in the Prometheus text exposition
/// format, for the status server's `/metrics` route.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).to_string())
}
