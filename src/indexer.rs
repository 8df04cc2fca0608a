// src/indexer.rs

//! # Pipeline Orchestration
//!
//! Owns the single-writer scan loop: plan the startup catch-up, then
//! repeatedly pick the next window below the confirmed head, scan it,
//! persist it, and advance the checkpoint. Every failure mode retries the
//! same window after a backoff; because persistence is idempotent and the
//! checkpoint only moves after a committed window, a crash or retry at any
//! point re-processes at most one window and never skips one.
//!
//! The lag monitor and status server run as side tasks fed by shared
//! handles ([`PacingControls`], a checkpoint watch channel); they never
//! write to the pipeline's state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool_postgres::Pool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catchup::{self, CatchUpPlan};
use crate::checkpoint::CheckpointStore;
use crate::config::IndexerConfig;
use crate::errors::{IndexerError, RpcError, ScanError, StoreError};
use crate::lag::{LagMonitor, PacingControls};
use crate::metrics;
use crate::persister::EventPersister;
use crate::rpc::RpcManager;
use crate::scanner::EventScanner;
use crate::types::{ScanTarget, ScanWindow};

/// Expands the configured contract/event matrix into one scan target per
/// (contract, event kind) pair.
pub fn scan_targets(cfg: &IndexerConfig) -> Vec<ScanTarget> {
    cfg.scan
        .targets
        .iter()
        .flat_map(|target| {
            target
                .events
                .iter()
                .map(|kind| ScanTarget::new(target.contract_address, *kind))
        })
        .collect()
}

pub struct Indexer {
    rpc: Arc<RpcManager>,
    scanner: EventScanner,
    persister: EventPersister,
    checkpoints: CheckpointStore,
    controls: Arc<PacingControls>,
    checkpoint_tx: watch::Sender<u64>,
    checkpoint_rx: watch::Receiver<u64>,
    shutdown: CancellationToken,

    batch_size: u64,
    confirmation_blocks: u64,
    genesis_block: u64,
    error_backoff: Duration,
    small_gap_limit: u64,
    catch_up: crate::config::CatchUpConfig,
}

impl Indexer {
    pub fn new(
        cfg: &IndexerConfig,
        pool: Pool,
        rpc: Arc<RpcManager>,
        shutdown: CancellationToken,
    ) -> Self {
        let controls = Arc::new(PacingControls::new(&cfg.scan, &cfg.lag));
        let scanner = EventScanner::new(rpc.clone(), scan_targets(cfg), &cfg.scan);
        let persister = EventPersister::new(pool.clone());
        let checkpoints = CheckpointStore::new(pool, cfg.indexer_id.clone());
        let (checkpoint_tx, checkpoint_rx) = watch::channel(0u64);
        Self {
            rpc,
            scanner,
            persister,
            checkpoints,
            controls,
            checkpoint_tx,
            checkpoint_rx,
            shutdown,
            batch_size: cfg.scan.batch_size(),
            confirmation_blocks: cfg.scan.confirmation_blocks(),
            genesis_block: cfg.scan.genesis_block(),
            error_backoff: Duration::from_secs(cfg.scan.error_backoff_secs()),
            small_gap_limit: cfg.catch_up.small_gap_limit(),
            catch_up: cfg.catch_up.clone(),
        }
    }

    /// Shared pacing handle for the lag monitor and status server.
    pub fn pacing_controls(&self) -> Arc<PacingControls> {
        self.controls.clone()
    }

    /// Checkpoint feed for out-of-loop observers.
    pub fn checkpoint_watch(&self) -> watch::Receiver<u64> {
        self.checkpoint_rx.clone()
    }

    pub fn build_monitor(&self, cfg: &IndexerConfig) -> Arc<LagMonitor> {
        Arc::new(LagMonitor::new(
            self.rpc.clone(),
            self.checkpoint_watch(),
            self.controls.clone(),
            &cfg.lag,
        ))
    }

    /// The live scan loop. Returns when the shutdown token fires (after
    /// the in-flight window committed) or on an unrecoverable store
    /// conflict.
    pub async fn run(&self) -> Result<(), IndexerError> {
        self.persister.check_schema_contract().await?;

        let checkpoint = self.checkpoints.load().await?;
        let last_indexed = checkpoint.as_ref().map(|cp| cp.last_indexed_block);
        if let Some(cp) = &checkpoint {
            info!(
                last_indexed_block = cp.last_indexed_block,
                updated_at = %cp.updated_at,
                "loaded checkpoint"
            );
        }

        let chain_head = self.rpc.block_number().await?;
        let plan = catchup::plan(chain_head, last_indexed, self.genesis_block, &self.catch_up);
        let mut cursor = catchup::apply(&plan, &self.checkpoints).await?;
        let _ = self.checkpoint_tx.send(cursor.saturating_sub(1));

        info!(
            cursor,
            chain_head,
            strategy = ?plan.strategy,
            "starting scan loop"
        );

        while !self.shutdown.is_cancelled() {
            match self.next_window(&plan, cursor).await {
                Ok(Some(window)) => match self.process_window(window).await {
                    Ok(()) => {
                        cursor = window.to + 1;
                    }
                    Err(WindowFailure::Retry) => {
                        self.pause(self.error_backoff).await;
                    }
                    Err(WindowFailure::Fatal(err)) => return Err(err),
                },
                Ok(None) => {
                    // Caught up to the confirmed head. Idle one poll.
                    let interval = self.controls.snapshot().await.poll_interval;
                    self.pause(interval).await;
                }
                Err(err) => {
                    error!(error = %err, "head query failed, backing off");
                    self.pause(self.error_backoff).await;
                }
            }
        }
        info!(cursor, "scan loop stopped");
        Ok(())
    }

    /// The next window to scan, or `None` while caught up. Window width is
    /// the pacing batch size times the catch-up multiplier, never beyond
    /// the configured maximum, and the upper bound always stays
    /// `confirmation_blocks` behind head.
    async fn next_window(&self, plan: &CatchUpPlan, cursor: u64) -> Result<Option<ScanWindow>, RpcError> {
        let chain_head = self.rpc.block_number().await?;
        let safe_head = chain_head.saturating_sub(self.confirmation_blocks);
        if safe_head < cursor {
            return Ok(None);
        }

        let pacing = self.controls.snapshot().await;
        let gap = safe_head.saturating_sub(cursor);
        let multiplier = plan.effective_batch_multiplier(gap, self.small_gap_limit);
        let width = pacing
            .batch_size
            .saturating_mul(multiplier)
            .min(self.controls.max_batch_size())
            .max(1);
        let to = cursor.saturating_add(width - 1).min(safe_head);
        Ok(Some(ScanWindow::new(cursor, to)))
    }

    /// Scan, persist, checkpoint one window. All three stages must succeed
    /// before the cursor moves.
    async fn process_window(&self, window: ScanWindow) -> Result<(), WindowFailure> {
        let started = Instant::now();

        let scan = match self.scanner.scan_window(window).await {
            Ok(scan) => scan,
            Err(ScanError::Rpc(RpcError::NoHealthyEndpoint { open, total })) => {
                error!(
                    from = window.from,
                    to = window.to,
                    open_circuits = open,
                    total_endpoints = total,
                    "no healthy endpoint, window will be retried"
                );
                metrics::observe_window("rpc_unavailable", started.elapsed());
                return Err(WindowFailure::Retry);
            }
            Err(ScanError::WindowAborted { from, to, reason }) => {
                error!(
                    from,
                    to,
                    reason = %reason,
                    "window aborted: a single block exceeds provider limits; \
                     retrying, but this needs operator attention"
                );
                metrics::observe_window("aborted", started.elapsed());
                return Err(WindowFailure::Retry);
            }
            Err(err) => {
                warn!(
                    from = window.from,
                    to = window.to,
                    error = %err,
                    "window scan failed, will retry"
                );
                metrics::observe_window("scan_error", started.elapsed());
                return Err(WindowFailure::Retry);
            }
        };

        let written = match self.persister.persist(&scan.events).await {
            Ok(written) => written,
            Err(err) => {
                error!(
                    from = window.from,
                    to = window.to,
                    error = %err,
                    "persist failed, window will be retried"
                );
                metrics::observe_window("store_error", started.elapsed());
                return Err(WindowFailure::Retry);
            }
        };

        if let Err(err) = self.checkpoints.advance(window.to).await {
            error!(
                block = window.to,
                error = %err,
                "checkpoint advance failed"
            );
            let failure = advance_failure(err);
            let outcome = match &failure {
                WindowFailure::Fatal(_) => "checkpoint_conflict",
                WindowFailure::Retry => "checkpoint_error",
            };
            metrics::observe_window(outcome, started.elapsed());
            return Err(failure);
        }
        let _ = self.checkpoint_tx.send(window.to);
        metrics::observe_window("ok", started.elapsed());

        if scan.events.is_empty() && scan.dropped_reverted == 0 && scan.dropped_undecodable == 0 {
            debug!(from = window.from, to = window.to, "window empty");
        } else {
            info!(
                from = window.from,
                to = window.to,
                events = scan.events.len(),
                written,
                dropped_reverted = scan.dropped_reverted,
                dropped_undecodable = scan.dropped_undecodable,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "window committed"
            );
        }
        Ok(())
    }

    /// Bounded re-scan of a historical range. Persists idempotently and
    /// leaves the checkpoint untouched, so it is safe to run next to a
    /// live indexer and is the repair path for skipped or suspect ranges.
    pub async fn run_backfill(&self, from: u64, to: u64) -> Result<BackfillSummary, IndexerError> {
        if from > to {
            return Err(IndexerError::Config(format!(
                "backfill range is inverted: {} > {}",
                from, to
            )));
        }
        self.persister.check_schema_contract().await?;
        info!(from, to, "starting backfill");

        let mut summary = BackfillSummary::default();
        let mut cursor = from;
        while cursor <= to {
            if self.shutdown.is_cancelled() {
                warn!(cursor, "backfill interrupted, rerun with the same range to finish");
                break;
            }
            let window = ScanWindow::new(cursor, cursor.saturating_add(self.batch_size - 1).min(to));
            match self.process_backfill_window(window, &mut summary).await {
                Ok(()) => cursor = window.to + 1,
                Err(()) => self.pause(self.error_backoff).await,
            }
        }

        info!(
            from,
            to,
            scanned = summary.events_scanned,
            written = summary.events_written,
            "backfill finished"
        );
        Ok(summary)
    }

    async fn process_backfill_window(
        &self,
        window: ScanWindow,
        summary: &mut BackfillSummary,
    ) -> Result<(), ()> {
        let scan = match self.scanner.scan_window(window).await {
            Ok(scan) => scan,
            Err(err) => {
                warn!(
                    from = window.from,
                    to = window.to,
                    error = %err,
                    "backfill window failed, will retry"
                );
                return Err(());
            }
        };
        match self.persister.persist(&scan.events).await {
            Ok(written) => {
                summary.windows += 1;
                summary.events_scanned += scan.events.len() as u64;
                summary.events_written += written as u64;
                debug!(
                    from = window.from,
                    to = window.to,
                    events = scan.events.len(),
                    written,
                    "backfill window committed"
                );
                Ok(())
            }
            Err(err) => {
                warn!(
                    from = window.from,
                    to = window.to,
                    error = %err,
                    "backfill persist failed, will retry"
                );
                Err(())
            }
        }
    }

    /// Cancellable sleep so shutdown never waits out a backoff.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

enum WindowFailure {
    /// Transient; retry the same window after the error backoff.
    Retry,
    /// Stop the pipeline.
    Fatal(IndexerError),
}

/// Classifies a failed checkpoint advance. A regression refusal means
/// another writer owns this checkpoint and the pipeline must stop;
/// continuing would interleave two cursors. Any other store error is
/// transient and the window retries with the checkpoint unadvanced.
fn advance_failure(err: StoreError) -> WindowFailure {
    if matches!(err, StoreError::CheckpointRegression { .. }) {
        WindowFailure::Fatal(IndexerError::Store(err))
    } else {
        WindowFailure::Retry
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillSummary {
    pub windows: u64,
    pub events_scanned: u64,
    pub events_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_conflict_stops_other_store_errors_retry() {
        let conflict = advance_failure(StoreError::CheckpointRegression {
            current: 120,
            requested: 90,
        });
        assert!(matches!(
            conflict,
            WindowFailure::Fatal(IndexerError::Store(StoreError::CheckpointRegression { .. }))
        ));

        let pool_down = advance_failure(StoreError::Pool(deadpool_postgres::PoolError::Closed));
        assert!(matches!(pool_down, WindowFailure::Retry));

        let unreachable = advance_failure(StoreError::NotAvailable("connection refused".into()));
        assert!(matches!(unreachable, WindowFailure::Retry));
    }
}
