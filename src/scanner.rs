// src/scanner.rs

//! # Event Scanner
//!
//! Pulls logs for every configured (contract, event-kind) pair over one
//! block window, decodes them, and filters out anything that did not come
//! from a successful transaction. Per-target fetches run concurrently up to
//! a configured limit; a failure in any target aborts the whole window so
//! the checkpoint never advances past a partially scanned range.
//!
//! When a provider rejects a range as too large the scanner splits the
//! range at its midpoint and keeps going, so oversized windows converge to
//! whatever the provider tolerates without operator tuning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::{Log, H256};
use futures::stream::{self, StreamExt, TryStreamExt};
use moka::future::Cache;
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::decoder;
use crate::errors::{RpcError, ScanError};
use crate::metrics;
use crate::rpc::RpcManager;
use crate::types::{IndexedEvent, ScanTarget, ScanWindow, WindowScan};

/// Outcome of scanning one target within a window.
struct TargetScan {
    label: String,
    events: Vec<IndexedEvent>,
    dropped_reverted: u64,
    dropped_undecodable: u64,
}

pub struct EventScanner {
    rpc: Arc<RpcManager>,
    targets: Vec<ScanTarget>,
    max_concurrent_targets: usize,
    /// Receipt success by transaction hash. Many events share a
    /// transaction, and adjacent windows re-check the same hashes after a
    /// retry, so this cache saves a large share of receipt calls.
    receipt_status: Cache<H256, bool>,
}

impl EventScanner {
    pub fn new(rpc: Arc<RpcManager>, targets: Vec<ScanTarget>, cfg: &ScanConfig) -> Self {
        let receipt_status = Cache::builder()
            .max_capacity(cfg.receipt_cache_size())
            .time_to_live(Duration::from_secs(cfg.receipt_cache_ttl_secs()))
            .build();
        Self {
            rpc,
            targets,
            max_concurrent_targets: cfg.max_concurrent_targets(),
            receipt_status,
        }
    }

    pub fn targets(&self) -> &[ScanTarget] {
        &self.targets
    }

    /// Scan every target over `window`. Returns all validated events sorted
    /// by (block_number, log_index) plus per-target counts.
    pub async fn scan_window(&self, window: ScanWindow) -> Result<WindowScan, ScanError> {
        let outcomes: Vec<TargetScan> = stream::iter(self.targets.iter().copied())
            .map(|target| self.scan_target(target, window))
            .buffer_unordered(self.max_concurrent_targets)
            .try_collect()
            .await?;

        let mut scan = WindowScan::default();
        for outcome in outcomes {
            scan.per_target_counts
                .push((outcome.label, outcome.events.len() as u64));
            scan.dropped_reverted += outcome.dropped_reverted;
            scan.dropped_undecodable += outcome.dropped_undecodable;
            scan.events.extend(outcome.events);
        }
        scan.events
            .sort_unstable_by_key(|e| (e.block_number, e.log_index));
        debug!(
            window = %window,
            events = scan.events.len(),
            dropped_reverted = scan.dropped_reverted,
            dropped_undecodable = scan.dropped_undecodable,
            "window scan complete"
        );
        Ok(scan)
    }

    async fn scan_target(
        &self,
        target: ScanTarget,
        window: ScanWindow,
    ) -> Result<TargetScan, ScanError> {
        let logs = self.fetch_logs_adaptive(&target, window).await?;
        let mut outcome = TargetScan {
            label: target.label(),
            events: Vec::with_capacity(logs.len()),
            dropped_reverted: 0,
            dropped_undecodable: 0,
        };

        for log in &logs {
            let candidate = match decoder::decode_log(target.event_kind, log) {
                Ok(candidate) => candidate,
                Err(err) => {
                    // One malformed log must not sink the window.
                    warn!(
                        target = %outcome.label,
                        block = ?log.block_number,
                        tx = ?log.transaction_hash,
                        error = %err,
                        "dropping undecodable log"
                    );
                    outcome.dropped_undecodable += 1;
                    metrics::inc_dropped_log(target.event_kind.as_str(), "undecodable");
                    continue;
                }
            };

            if !self.transaction_succeeded(candidate.transaction_hash).await? {
                debug!(
                    target = %outcome.label,
                    tx = ?candidate.transaction_hash,
                    block = candidate.block_number,
                    "dropping log from reverted transaction"
                );
                outcome.dropped_reverted += 1;
                metrics::inc_dropped_log(target.event_kind.as_str(), "reverted");
                continue;
            }

            outcome.events.push(IndexedEvent {
                block_number: candidate.block_number,
                transaction_hash: candidate.transaction_hash,
                log_index: candidate.log_index,
                event_kind: candidate.event_kind,
                contract_address: candidate.contract_address,
                payload: candidate.payload,
                tx_status: 1,
                observed_at: Utc::now(),
            });
        }

        metrics::add_events_scanned(target.event_kind.as_str(), outcome.events.len() as u64);
        Ok(outcome)
    }

    /// Fetch logs for one target, splitting the range whenever the provider
    /// rejects it as too large. Sub-ranges are worked off a stack; order is
    /// restored by the caller's sort.
    async fn fetch_logs_adaptive(
        &self,
        target: &ScanTarget,
        window: ScanWindow,
    ) -> Result<Vec<Log>, ScanError> {
        let topic0 = decoder::topic0(target.event_kind);
        let mut pending: Vec<(u64, u64)> = vec![(window.from, window.to)];
        let mut collected = Vec::new();

        while let Some((from, to)) = pending.pop() {
            match self
                .rpc
                .logs_in_range(target.contract_address, topic0, from, to)
                .await
            {
                Ok(mut logs) => collected.append(&mut logs),
                Err(RpcError::RangeTooLarge { message, .. }) => {
                    if from == to {
                        // Cannot shrink a single block; something else is
                        // wrong upstream.
                        return Err(ScanError::WindowAborted {
                            from,
                            to,
                            reason: format!(
                                "provider rejected a single-block range: {}",
                                message
                            ),
                        });
                    }
                    let (left, right) = split_range(from, to);
                    metrics::inc_range_halving();
                    debug!(
                        target = %target.label(),
                        from = from,
                        to = to,
                        "halving rejected range"
                    );
                    pending.push(right);
                    pending.push(left);
                }
                Err(err) => return Err(ScanError::Rpc(err)),
            }
        }
        Ok(collected)
    }

    /// Whether the transaction behind a log actually succeeded. A missing
    /// receipt fails the window; guessing either way would break the
    /// stored-events invariant.
    async fn transaction_succeeded(&self, tx_hash: H256) -> Result<bool, ScanError> {
        if let Some(status) = self.receipt_status.get(&tx_hash).await {
            metrics::inc_receipt_cache(true);
            return Ok(status);
        }
        metrics::inc_receipt_cache(false);
        let receipt = self.rpc.transaction_receipt(tx_hash).await?;
        match receipt {
            None => Err(ScanError::ReceiptUnavailable(tx_hash)),
            Some(receipt) => {
                let succeeded = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
                self.receipt_status.insert(tx_hash, succeeded).await;
                Ok(succeeded)
            }
        }
    }
}

fn split_range(from: u64, to: u64) -> ((u64, u64), (u64, u64)) {
    let mid = from + (to - from) / 2;
    ((from, mid), (mid + 1, to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_halves_at_midpoint() {
        assert_eq!(split_range(0, 10), ((0, 5), (6, 10)));
        assert_eq!(split_range(100, 101), ((100, 100), (101, 101)));
        assert_eq!(split_range(5, 7), ((5, 6), (7, 7)));
    }

    #[test]
    fn split_covers_whole_range_without_overlap() {
        let (left, right) = split_range(1_000, 11_000);
        assert_eq!(left.0, 1_000);
        assert_eq!(right.1, 11_000);
        assert_eq!(left.1 + 1, right.0);
    }
}
