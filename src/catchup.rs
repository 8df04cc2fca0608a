// src/catchup.rs

//! # Catch-Up Selector
//!
//! Startup-time classification of the gap between the persisted checkpoint
//! and the chain head. The decision is a pure function of the gap and the
//! configured limits so every branch is table-testable; applying a
//! skip-to-recent decision is the only part that touches the store.
//!
//! Skip-to-recent permanently abandons the events in the skipped range and
//! is therefore opt-in. When it is disabled the planner degrades to fast
//! catch-up and raises a loud log instead, leaving the operator to either
//! enable the skip or run a bounded backfill.

use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::CatchUpConfig;
use crate::errors::StoreError;
use crate::metrics;

//================================================================================================//
//                                      Strategy Planning                                         //
//================================================================================================//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpStrategy {
    /// Checkpoint is at head. Wait for new blocks.
    UpToDate,
    /// Small gap. Resume at the configured batch size.
    Normal,
    /// Large gap. Resume with enlarged batches until the gap closes.
    Fast { batch_multiplier: u64 },
    /// Oversized gap. Jump the checkpoint forward, abandoning the range.
    SkipToRecent { target_block: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct CatchUpPlan {
    pub strategy: CatchUpStrategy,
    pub chain_head: u64,
    pub resume_from: u64,
    pub gap: u64,
}

impl CatchUpPlan {
    /// Batch multiplier the scan loop should apply while executing this
    /// plan. Self-clearing: once the live gap shrinks back under the small
    /// gap limit the multiplier drops to 1 without a re-plan.
    pub fn effective_batch_multiplier(&self, current_gap: u64, small_gap_limit: u64) -> u64 {
        match self.strategy {
            CatchUpStrategy::Fast { batch_multiplier } if current_gap > small_gap_limit => {
                batch_multiplier
            }
            _ => 1,
        }
    }
}

/// Classify the startup gap. `last_indexed` is `None` on a fresh install,
/// which resumes from `genesis_block` and is never treated as a gap to
/// skip: an operator installing fresh with a deep genesis asked for the
/// full history.
pub fn plan(
    chain_head: u64,
    last_indexed: Option<u64>,
    genesis_block: u64,
    cfg: &CatchUpConfig,
) -> CatchUpPlan {
    let last = match last_indexed {
        Some(block) => block,
        None => {
            let resume_from = genesis_block;
            let gap = chain_head.saturating_sub(resume_from);
            info!(
                chain_head,
                genesis_block, gap, "no checkpoint found, starting from genesis block"
            );
            return CatchUpPlan {
                strategy: if gap == 0 {
                    CatchUpStrategy::UpToDate
                } else {
                    CatchUpStrategy::Normal
                },
                chain_head,
                resume_from,
                gap,
            };
        }
    };

    let gap = chain_head.saturating_sub(last);
    let strategy = if gap == 0 {
        CatchUpStrategy::UpToDate
    } else if gap <= cfg.small_gap_limit() {
        CatchUpStrategy::Normal
    } else if gap <= cfg.large_gap_limit() {
        CatchUpStrategy::Fast {
            batch_multiplier: cfg.fast_batch_multiplier(),
        }
    } else {
        let target_block = chain_head.saturating_sub(cfg.safety_margin());
        if !cfg.allow_skip_ahead {
            error!(
                gap,
                large_gap_limit = cfg.large_gap_limit(),
                skip_target = target_block,
                "gap exceeds the large gap limit but skip-ahead is disabled; \
                 falling back to fast catch-up, which may take a long time"
            );
            CatchUpStrategy::Fast {
                batch_multiplier: cfg.fast_batch_multiplier(),
            }
        } else if target_block <= last {
            // Head barely moved past the checkpoint relative to the margin.
            CatchUpStrategy::Fast {
                batch_multiplier: cfg.fast_batch_multiplier(),
            }
        } else {
            CatchUpStrategy::SkipToRecent { target_block }
        }
    };

    CatchUpPlan {
        strategy,
        chain_head,
        resume_from: last + 1,
        gap,
    }
}

//================================================================================================//
//                                      Plan Application                                          //
//================================================================================================//

/// Execute the plan's side effects. Only skip-to-recent mutates anything;
/// every other strategy just logs its decision.
pub async fn apply(plan: &CatchUpPlan, checkpoints: &CheckpointStore) -> Result<u64, StoreError> {
    match plan.strategy {
        CatchUpStrategy::UpToDate => {
            info!(chain_head = plan.chain_head, "checkpoint is at chain head");
            Ok(plan.resume_from)
        }
        CatchUpStrategy::Normal => {
            info!(
                gap = plan.gap,
                resume_from = plan.resume_from,
                "resuming at normal pace"
            );
            Ok(plan.resume_from)
        }
        CatchUpStrategy::Fast { batch_multiplier } => {
            warn!(
                gap = plan.gap,
                batch_multiplier,
                resume_from = plan.resume_from,
                "large gap detected, resuming with enlarged batches"
            );
            Ok(plan.resume_from)
        }
        CatchUpStrategy::SkipToRecent { target_block } => {
            let skipped = target_block.saturating_sub(plan.resume_from.saturating_sub(1));
            error!(
                from = plan.resume_from,
                to = target_block,
                skipped_blocks = skipped,
                "skipping ahead: events in this range are permanently dropped \
                 and can only be recovered with an explicit backfill"
            );
            checkpoints.force_set(target_block).await?;
            metrics::add_skipped_blocks(skipped);
            Ok(target_block + 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(allow_skip_ahead: bool) -> CatchUpConfig {
        CatchUpConfig {
            small_gap_limit: Some(1_000),
            large_gap_limit: Some(100_000),
            safety_margin: Some(1_000),
            allow_skip_ahead,
            fast_batch_multiplier: Some(2),
        }
    }

    #[test]
    fn small_gap_resumes_normally() {
        let plan = plan(1_000_000, Some(999_990), 0, &cfg(true));
        assert_eq!(plan.strategy, CatchUpStrategy::Normal);
        assert_eq!(plan.resume_from, 999_991);
        assert_eq!(plan.gap, 10);
    }

    #[test]
    fn zero_gap_is_up_to_date() {
        let plan = plan(1_000_000, Some(1_000_000), 0, &cfg(true));
        assert_eq!(plan.strategy, CatchUpStrategy::UpToDate);
    }

    #[test]
    fn large_gap_enables_fast_catch_up() {
        let plan = plan(1_000_000, Some(900_000), 0, &cfg(true));
        assert_eq!(
            plan.strategy,
            CatchUpStrategy::Fast { batch_multiplier: 2 }
        );
        assert_eq!(plan.gap, 100_000);
    }

    #[test]
    fn oversized_gap_skips_to_recent_when_allowed() {
        let plan = plan(1_000_000, Some(1), 0, &cfg(true));
        assert_eq!(
            plan.strategy,
            CatchUpStrategy::SkipToRecent { target_block: 999_000 }
        );
    }

    #[test]
    fn oversized_gap_falls_back_to_fast_when_skip_disabled() {
        let plan = plan(1_000_000, Some(1), 0, &cfg(false));
        assert_eq!(
            plan.strategy,
            CatchUpStrategy::Fast { batch_multiplier: 2 }
        );
    }

    #[test]
    fn boundary_gaps_classify_inclusively() {
        // Exactly at the small limit: still normal.
        let at_small = plan(10_000, Some(9_000), 0, &cfg(true));
        assert_eq!(at_small.strategy, CatchUpStrategy::Normal);

        // One past the small limit: fast.
        let past_small = plan(10_001, Some(9_000), 0, &cfg(true));
        assert_eq!(
            past_small.strategy,
            CatchUpStrategy::Fast { batch_multiplier: 2 }
        );

        // One past the large limit: skip candidate.
        let past_large = plan(200_002, Some(100_001), 0, &cfg(true));
        assert_eq!(
            past_large.strategy,
            CatchUpStrategy::SkipToRecent { target_block: 199_002 }
        );
    }

    #[test]
    fn fresh_install_starts_from_genesis() {
        let plan = plan(5_000, None, 4_000, &cfg(true));
        assert_eq!(plan.strategy, CatchUpStrategy::Normal);
        assert_eq!(plan.resume_from, 4_000);
        assert_eq!(plan.gap, 1_000);
    }

    #[test]
    fn fast_multiplier_clears_once_gap_shrinks() {
        let plan = plan(1_000_000, Some(900_000), 0, &cfg(true));
        assert_eq!(plan.effective_batch_multiplier(50_000, 1_000), 2);
        assert_eq!(plan.effective_batch_multiplier(1_000, 1_000), 1);
        assert_eq!(plan.effective_batch_multiplier(0, 1_000), 1);
    }
}
