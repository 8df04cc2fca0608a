//! # Centralized Error Handling
//!
//! Hierarchical error types for the indexer. Each subsystem owns a typed
//! enum; the top-level [`IndexerError`] aggregates them so the main loop and
//! binary can match on failure class instead of parsing strings.

use ethers::types::H256;
use thiserror::Error;

/// The top-level error type for the indexing pipeline.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures surfaced by the RPC connection manager.
///
/// `RangeTooLarge` and `NoHealthyEndpoint` are structurally distinct because
/// callers react to them differently: the scanner halves its window on the
/// former, and the main loop enters extended backoff on the latter. Neither
/// is retried inside the manager.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("RPC call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("Rate limited by provider: {0}")]
    RateLimited(String),
    #[error("Block range [{from}, {to}] rejected as too large: {message}")]
    RangeTooLarge { from: u64, to: u64, message: String },
    #[error("No healthy RPC endpoint available ({open} of {total} circuits open)")]
    NoHealthyEndpoint { open: usize, total: usize },
    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),
    #[error("Retries exhausted for '{method}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        method: String,
        attempts: u32,
        last_error: String,
    },
}

/// Failures that abort a single scan window.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("RPC failure during scan: {0}")]
    Rpc(#[from] RpcError),
    #[error("Receipt unavailable for transaction {0:?}")]
    ReceiptUnavailable(H256),
    #[error("Scan window [{from}, {to}] aborted: {reason}")]
    WindowAborted { from: u64, to: u64, reason: String },
}

/// Failures decoding a single raw log into an event.
///
/// These never abort a window; the scanner logs and skips the offending log.
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("Unknown event signature {0:?}")]
    UnknownSignature(H256),
    #[error("Log has no topics")]
    MissingTopics,
    #[error("Expected {expected} topics, found {found}")]
    TopicCount { expected: usize, found: usize },
    #[error("Log data too short: needed {needed} bytes, found {found}")]
    DataTooShort { needed: usize, found: usize },
    #[error("Log missing field '{0}'")]
    MissingField(&'static str),
    #[error("Field '{0}' does not fit its declared width")]
    ValueOutOfRange(&'static str),
}

/// Failures from the persistence layer (events, checkpoint, schema probe).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("Database query error: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("Database not available: {0}")]
    NotAvailable(String),
    #[error("Database configuration error: {0}")]
    Config(String),
    #[error("Schema version mismatch: store has {found}, expected {expected}")]
    SchemaVersion { expected: i32, found: i32 },
    #[error("Checkpoint regression refused: current {current}, requested {requested}")]
    CheckpointRegression { current: u64, requested: u64 },
    #[error("Verification failed for event {key}: {reason}")]
    VerificationFailed { key: String, reason: String },
}

impl RpcError {
    /// True when the error should count against an endpoint's circuit
    /// breaker. Range rejections and rate limits are provider policy
    /// responses from a live endpoint, not health signals.
    pub fn is_endpoint_failure(&self) -> bool {
        !matches!(
            self,
            RpcError::RangeTooLarge { .. } | RpcError::RateLimited(_)
        )
    }
}
