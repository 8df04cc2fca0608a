// src/lag.rs

//! # Lag Monitor / Emergency Controller
//!
//! Samples chain head against the committed checkpoint on its own timer
//! and drives the NORMAL/EMERGENCY mode with hysteresis: emergency engages
//! at `emergency_threshold` and only clears below the strictly lower
//! `recovery_threshold`, so lag oscillating near the boundary cannot flap
//! the mode. A stricter `critical_threshold` raises a standing alert
//! without changing behavior.
//!
//! The monitor never blocks the scan loop. It mutates only its own sample
//! window and the shared [`PacingControls`], which the loop reads at the
//! top of each iteration; one iteration on stale settings is acceptable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LagConfig, ScanConfig};
use crate::metrics;
use crate::rpc::RpcManager;
use crate::types::{IndexerMode, LagSample};

//================================================================================================//
//                                      Pacing Controls                                           //
//================================================================================================//

/// Batch size and poll cadence the main loop should currently use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingState {
    pub mode: IndexerMode,
    pub batch_size: u64,
    pub poll_interval: Duration,
}

/// Shared knobs between the monitor (writer) and the scan loop (reader).
#[derive(Debug)]
pub struct PacingControls {
    state: RwLock<PacingState>,
    base_batch_size: u64,
    base_poll_interval: Duration,
    emergency_multiplier: u64,
    max_batch_size: u64,
}

impl PacingControls {
    pub fn new(scan: &ScanConfig, lag: &LagConfig) -> Self {
        let base_poll_interval = Duration::from_millis(scan.poll_interval_ms());
        Self {
            state: RwLock::new(PacingState {
                mode: IndexerMode::Normal,
                batch_size: scan.batch_size(),
                poll_interval: base_poll_interval,
            }),
            base_batch_size: scan.batch_size(),
            base_poll_interval,
            emergency_multiplier: lag.emergency_batch_multiplier(),
            max_batch_size: lag.max_batch_size(),
        }
    }

    pub async fn snapshot(&self) -> PacingState {
        *self.state.read().await
    }

    pub async fn mode(&self) -> IndexerMode {
        self.state.read().await.mode
    }

    pub fn max_batch_size(&self) -> u64 {
        self.max_batch_size
    }

    async fn enter_emergency(&self) {
        let mut state = self.state.write().await;
        state.mode = IndexerMode::Emergency;
        state.batch_size = self
            .base_batch_size
            .saturating_mul(self.emergency_multiplier)
            .min(self.max_batch_size);
        state.poll_interval = (self.base_poll_interval / self.emergency_multiplier.max(1) as u32)
            .max(Duration::from_millis(50));
    }

    async fn exit_emergency(&self) {
        let mut state = self.state.write().await;
        state.mode = IndexerMode::Normal;
        state.batch_size = self.base_batch_size;
        state.poll_interval = self.base_poll_interval;
    }
}

/// Mode transition with hysteresis. Pure so the flapping properties are
/// directly testable.
fn next_mode(current: IndexerMode, lag: u64, emergency_threshold: u64, recovery_threshold: u64) -> IndexerMode {
    match current {
        IndexerMode::Normal if lag >= emergency_threshold => IndexerMode::Emergency,
        IndexerMode::Emergency if lag < recovery_threshold => IndexerMode::Normal,
        other => other,
    }
}

//================================================================================================//
//                                        Lag Monitor                                             //
//================================================================================================//

pub struct LagMonitor {
    rpc: Arc<RpcManager>,
    /// Latest committed checkpoint, published by the scan loop.
    checkpoint_rx: watch::Receiver<u64>,
    controls: Arc<PacingControls>,
    sample_interval: Duration,
    emergency_threshold: u64,
    recovery_threshold: u64,
    critical_threshold: u64,
    sample_window: usize,
    samples: Mutex<VecDeque<LagSample>>,
    critical_active: AtomicBool,
}

impl LagMonitor {
    pub fn new(
        rpc: Arc<RpcManager>,
        checkpoint_rx: watch::Receiver<u64>,
        controls: Arc<PacingControls>,
        cfg: &LagConfig,
    ) -> Self {
        Self {
            rpc,
            checkpoint_rx,
            controls,
            sample_interval: Duration::from_millis(cfg.sample_interval_ms()),
            emergency_threshold: cfg.emergency_threshold(),
            recovery_threshold: cfg.recovery_threshold(),
            critical_threshold: cfg.critical_threshold(),
            sample_window: cfg.sample_window(),
            samples: Mutex::new(VecDeque::new()),
            critical_active: AtomicBool::new(false),
        }
    }

    /// Timer loop. Runs until cancelled; sampling failures are logged and
    /// skipped, never fatal.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            interval_ms = self.sample_interval.as_millis() as u64,
            emergency_threshold = self.emergency_threshold,
            recovery_threshold = self.recovery_threshold,
            critical_threshold = self.critical_threshold,
            "lag monitor started"
        );
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("lag monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.sample_once().await;
                }
            }
        }
    }

    /// The most recent sample, for the status surface.
    pub async fn latest_sample(&self) -> Option<LagSample> {
        self.samples.lock().await.back().copied()
    }

    /// Smoothed indexing throughput in blocks/sec across the rolling
    /// window. `None` until two samples exist.
    pub async fn smoothed_throughput(&self) -> Option<f64> {
        let samples = self.samples.lock().await;
        let (first, last) = (samples.front()?, samples.back()?);
        let elapsed = last
            .observed_at
            .duration_since(first.observed_at)
            .as_secs_f64();
        if elapsed <= f64::EPSILON {
            return None;
        }
        let indexed = last
            .last_indexed_block
            .saturating_sub(first.last_indexed_block);
        Some(indexed as f64 / elapsed)
    }

    async fn sample_once(&self) {
        let chain_head = match self.rpc.block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!(error = %err, "lag sample skipped: chain head unavailable");
                return;
            }
        };
        let last_indexed_block = *self.checkpoint_rx.borrow();
        let lag_blocks = chain_head.saturating_sub(last_indexed_block);

        {
            let mut samples = self.samples.lock().await;
            samples.push_back(LagSample {
                observed_at: Instant::now(),
                chain_head,
                last_indexed_block,
                lag_blocks,
            });
            while samples.len() > self.sample_window {
                samples.pop_front();
            }
        }
        metrics::set_chain_head(chain_head);
        metrics::set_lag_blocks(lag_blocks);
        if let Some(rate) = self.smoothed_throughput().await {
            metrics::set_indexing_rate(rate);
            debug!(
                chain_head,
                last_indexed_block, lag_blocks, blocks_per_sec = rate, "lag sample"
            );
        }

        self.evaluate_mode(lag_blocks).await;
        self.evaluate_critical(lag_blocks);
    }

    async fn evaluate_mode(&self, lag: u64) {
        let current = self.controls.mode().await;
        let next = next_mode(current, lag, self.emergency_threshold, self.recovery_threshold);
        if next == current {
            return;
        }
        match next {
            IndexerMode::Emergency => {
                self.controls.enter_emergency().await;
                let state = self.controls.snapshot().await;
                warn!(
                    lag_blocks = lag,
                    threshold = self.emergency_threshold,
                    batch_size = state.batch_size,
                    poll_interval_ms = state.poll_interval.as_millis() as u64,
                    "entering EMERGENCY mode"
                );
            }
            IndexerMode::Normal => {
                self.controls.exit_emergency().await;
                info!(
                    lag_blocks = lag,
                    recovery_threshold = self.recovery_threshold,
                    "lag recovered, returning to NORMAL mode"
                );
            }
        }
        metrics::set_mode(next);
    }

    fn evaluate_critical(&self, lag: u64) {
        let is_critical = lag >= self.critical_threshold;
        let was_critical = self.critical_active.swap(is_critical, Ordering::SeqCst);
        if is_critical && !was_critical {
            error!(
                lag_blocks = lag,
                critical_threshold = self.critical_threshold,
                "lag is critical; automatic catch-up is not keeping pace and \
                 operator intervention is warranted"
            );
        } else if !is_critical && was_critical {
            info!(lag_blocks = lag, "lag dropped below the critical threshold");
        }
        metrics::set_critical_lag(is_critical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, RpcConfig};
    use crate::rpc::RpcTransport;
    use async_trait::async_trait;
    use ethers::types::{Filter, Log, TransactionReceipt, H256};
    use std::sync::atomic::AtomicU64;

    #[test]
    fn emergency_engages_at_threshold_and_holds_until_recovery() {
        let (em, rec) = (1_000, 300);
        let mut mode = IndexerMode::Normal;

        mode = next_mode(mode, 999, em, rec);
        assert_eq!(mode, IndexerMode::Normal);
        mode = next_mode(mode, 1_000, em, rec);
        assert_eq!(mode, IndexerMode::Emergency);

        // Oscillation around the emergency threshold must not flap.
        for lag in [999, 1_001, 950, 1_000, 400, 301, 300] {
            mode = next_mode(mode, lag, em, rec);
            assert_eq!(mode, IndexerMode::Emergency, "lag {} should hold emergency", lag);
        }

        mode = next_mode(mode, 299, em, rec);
        assert_eq!(mode, IndexerMode::Normal);
        mode = next_mode(mode, 999, em, rec);
        assert_eq!(mode, IndexerMode::Normal);
    }

    #[tokio::test]
    async fn pacing_multiplies_batch_and_divides_interval() {
        let scan: ScanConfig = serde_json::from_value(serde_json::json!({
            "targets": [{
                "contract_address": "0x00000000000000000000000000000000000000aa",
                "events": ["staked"]
            }],
            "batch_size": 500,
            "poll_interval_ms": 2000
        }))
        .unwrap();
        let lag: LagConfig = serde_json::from_value(serde_json::json!({
            "emergency_batch_multiplier": 4,
            "max_batch_size": 1500
        }))
        .unwrap();

        let controls = PacingControls::new(&scan, &lag);
        let base = controls.snapshot().await;
        assert_eq!(base.mode, IndexerMode::Normal);
        assert_eq!(base.batch_size, 500);

        controls.enter_emergency().await;
        let boosted = controls.snapshot().await;
        assert_eq!(boosted.mode, IndexerMode::Emergency);
        // 500 * 4 capped at the configured maximum.
        assert_eq!(boosted.batch_size, 1500);
        assert_eq!(boosted.poll_interval, Duration::from_millis(500));

        controls.exit_emergency().await;
        let restored = controls.snapshot().await;
        assert_eq!(restored, base);
    }

    #[derive(Debug)]
    struct FixedHead {
        head: AtomicU64,
    }

    #[async_trait]
    impl RpcTransport for FixedHead {
        async fn block_number(&self) -> Result<u64, crate::errors::RpcError> {
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn get_logs(&self, _filter: &Filter) -> Result<Vec<Log>, crate::errors::RpcError> {
            Ok(vec![])
        }

        async fn transaction_receipt(
            &self,
            _hash: H256,
        ) -> Result<Option<TransactionReceipt>, crate::errors::RpcError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn monitor_flips_mode_from_samples() {
        let rpc_cfg = RpcConfig {
            endpoints: vec![EndpointConfig {
                url: "https://rpc.example.com".into(),
                priority: Some(0),
                name: Some("mock".into()),
                requests_per_second: None,
            }],
            max_retries: Some(1),
            retry_base_delay_ms: Some(1),
            retry_max_delay_ms: Some(2),
            jitter_factor: Some(0.0),
            call_timeout_secs: Some(5),
            circuit_failure_threshold: Some(3),
            circuit_cooldown_secs: Some(60),
        };
        let transport = Arc::new(FixedHead {
            head: AtomicU64::new(50_000),
        });
        let rpc = Arc::new(RpcManager::with_transports(&rpc_cfg, vec![transport.clone()]));

        let scan: ScanConfig = serde_json::from_value(serde_json::json!({
            "targets": [{
                "contract_address": "0x00000000000000000000000000000000000000aa",
                "events": ["staked"]
            }]
        }))
        .unwrap();
        let lag_cfg: LagConfig = serde_json::from_value(serde_json::json!({
            "emergency_threshold": 1000,
            "recovery_threshold": 300,
            "critical_threshold": 20000
        }))
        .unwrap();
        let controls = Arc::new(PacingControls::new(&scan, &lag_cfg));
        let (tx, rx) = watch::channel(10_000u64);
        let monitor = LagMonitor::new(rpc, rx, controls.clone(), &lag_cfg);

        // Head 50k vs checkpoint 10k: deep in emergency territory.
        monitor.sample_once().await;
        assert_eq!(controls.mode().await, IndexerMode::Emergency);
        let sample = monitor.latest_sample().await.unwrap();
        assert_eq!(sample.lag_blocks, 40_000);

        // Catch up to within the recovery band.
        tx.send(49_800).unwrap();
        monitor.sample_once().await;
        assert_eq!(controls.mode().await, IndexerMode::Normal);
    }
}
