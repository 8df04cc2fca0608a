//! Event ingestion pipeline for prediction-market contracts.
//!
//! Scans configured contracts for event logs over HTTP RPC, survives
//! endpoint failures with per-endpoint circuit breakers, persists decoded
//! events into Postgres exactly once, and tracks its own lag against the
//! chain head. A single writer owns the scan loop; the lag monitor and
//! status server observe it through shared read-only handles.

pub mod catchup;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod decoder;
pub mod errors;
pub mod indexer;
pub mod lag;
pub mod metrics;
pub mod persister;
pub mod rpc;
pub mod scanner;
pub mod status;
pub mod types;
