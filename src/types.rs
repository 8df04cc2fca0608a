//! # Shared Domain Types
//!
//! Core types passed between the scanner, persister, checkpoint store, and
//! monitors. Everything here is plain data; behavior lives in the component
//! modules.

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// The event streams this indexer replicates, one variant per on-chain
/// event signature. The variant doubles as the decoder schema selector and
/// as the `event_kind` discriminator in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MarketCreated,
    TicketPurchased,
    MarketResolved,
    RewardClaimed,
    Staked,
    Unstaked,
}

impl EventKind {
    /// Canonical Solidity event signature, hashed into topic0.
    pub fn signature_text(&self) -> &'static str {
        match self {
            EventKind::MarketCreated => "MarketCreated(uint256,address,uint64,uint64)",
            EventKind::TicketPurchased => "TicketPurchased(uint256,address,uint8,uint256)",
            EventKind::MarketResolved => "MarketResolved(uint256,uint8,address)",
            EventKind::RewardClaimed => "RewardClaimed(uint256,address,uint256)",
            EventKind::Staked => "Staked(address,uint256,uint256)",
            EventKind::Unstaked => "Unstaked(address,uint256,uint256)",
        }
    }

    /// Stable string used for the `event_kind` column and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MarketCreated => "market_created",
            EventKind::TicketPurchased => "ticket_purchased",
            EventKind::MarketResolved => "market_resolved",
            EventKind::RewardClaimed => "reward_claimed",
            EventKind::Staked => "staked",
            EventKind::Unstaked => "unstaked",
        }
    }

    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::MarketCreated,
            EventKind::TicketPurchased,
            EventKind::MarketResolved,
            EventKind::RewardClaimed,
            EventKind::Staked,
            EventKind::Unstaked,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (contract, event-kind) pair the scanner queries every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanTarget {
    pub contract_address: Address,
    pub event_kind: EventKind,
}

impl ScanTarget {
    pub fn new(contract_address: Address, event_kind: EventKind) -> Self {
        Self {
            contract_address,
            event_kind,
        }
    }

    /// Short label for logs and per-target metrics.
    pub fn label(&self) -> String {
        format!("{}@{:#x}", self.event_kind, self.contract_address)
    }
}

/// A decoded, receipt-validated event ready for persistence.
///
/// Natural key = (block_number, transaction_hash, log_index, event_kind);
/// the store enforces uniqueness on it and the persister treats conflicts
/// as no-ops, which is what makes overlapping re-scans safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedEvent {
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub event_kind: EventKind,
    pub contract_address: Address,
    pub payload: serde_json::Value,
    /// Receipt status of the originating transaction. Always 1 for stored
    /// events; kept as a column so backfill tooling can audit it.
    pub tx_status: i16,
    pub observed_at: DateTime<Utc>,
}

impl IndexedEvent {
    /// Render the natural key for log lines and verification errors.
    pub fn key_string(&self) -> String {
        format!(
            "({}, {:#x}, {}, {})",
            self.block_number, self.transaction_hash, self.log_index, self.event_kind
        )
    }
}

/// Durable cursor marking the last fully-indexed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_indexed_block: u64,
    pub updated_at: DateTime<Utc>,
}

/// One lag observation from the monitor's timer tick.
#[derive(Debug, Clone, Copy)]
pub struct LagSample {
    pub observed_at: Instant,
    pub chain_head: u64,
    pub last_indexed_block: u64,
    pub lag_blocks: u64,
}

/// Operating mode toggled by the lag monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexerMode {
    Normal,
    Emergency,
}

impl fmt::Display for IndexerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerMode::Normal => f.write_str("NORMAL"),
            IndexerMode::Emergency => f.write_str("EMERGENCY"),
        }
    }
}

/// Circuit breaker state for one RPC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("CLOSED"),
            CircuitState::Open => f.write_str("OPEN"),
            CircuitState::HalfOpen => f.write_str("HALF_OPEN"),
        }
    }
}

/// Point-in-time health of one managed endpoint, exposed via `/status`.
/// The lifetime counters survive circuit transitions, so a flapping
/// endpoint shows its history even while momentarily CLOSED.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub priority: u32,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

/// Read-only snapshot served by the status endpoint and the `status`
/// subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub indexer_id: String,
    pub last_indexed_block: u64,
    pub chain_head: u64,
    pub lag_blocks: u64,
    pub mode: IndexerMode,
    /// Smoothed indexing throughput. Absent until the lag monitor has at
    /// least two samples.
    pub blocks_per_second: Option<f64>,
    pub endpoints: Vec<EndpointStatus>,
}

/// One inclusive [from, to] block range processed as an atomic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub from: u64,
    pub to: u64,
}

impl ScanWindow {
    pub fn new(from: u64, to: u64) -> Self {
        debug_assert!(from <= to);
        Self { from, to }
    }

    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl fmt::Display for ScanWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Scanner output for one window: validated events plus per-target counts.
#[derive(Debug, Default)]
pub struct WindowScan {
    pub events: Vec<IndexedEvent>,
    pub per_target_counts: Vec<(String, u64)>,
    /// Logs dropped because their transaction reverted.
    pub dropped_reverted: u64,
    /// Logs dropped because they failed to decode.
    pub dropped_undecodable: u64,
}
