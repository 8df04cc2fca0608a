// src/checkpoint.rs

//! # Checkpoint Store
//!
//! One keyed row per indexer instance recording the last fully-indexed
//! block. Only the main loop advances it, and only after a window's
//! transaction commits. The upsert carries a monotonic guard so a buggy
//! caller cannot silently move the cursor backwards; rewinds go through
//! [`CheckpointStore::force_set`], which exists for operator tooling and
//! the skip-ahead catch-up path.

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::metrics;
use crate::types::Checkpoint;

pub struct CheckpointStore {
    pool: Pool,
    indexer_id: String,
}

impl CheckpointStore {
    pub fn new(pool: Pool, indexer_id: impl Into<String>) -> Self {
        Self {
            pool,
            indexer_id: indexer_id.into(),
        }
    }

    pub fn indexer_id(&self) -> &str {
        &self.indexer_id
    }

    /// The committed cursor, or `None` on a fresh install.
    pub async fn load(&self) -> Result<Option<Checkpoint>, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT last_indexed_block, updated_at FROM indexer_checkpoints \
                 WHERE indexer_id = $1",
                &[&self.indexer_id],
            )
            .await?;
        Ok(row.map(|row| Checkpoint {
            last_indexed_block: row.get::<_, i64>(0) as u64,
            updated_at: row.get::<_, DateTime<Utc>>(1),
        }))
    }

    /// Advance the cursor to `block`. Refuses to move backwards; equal
    /// writes are allowed so a retried window commit stays idempotent.
    pub async fn advance(&self, block: u64) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "INSERT INTO indexer_checkpoints (indexer_id, last_indexed_block, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (indexer_id) DO UPDATE \
                 SET last_indexed_block = EXCLUDED.last_indexed_block, updated_at = now() \
                 WHERE indexer_checkpoints.last_indexed_block <= EXCLUDED.last_indexed_block",
                &[&self.indexer_id, &(block as i64)],
            )
            .await?;
        if rows == 0 {
            let current = self
                .load()
                .await?
                .map(|c| c.last_indexed_block)
                .unwrap_or(0);
            return Err(StoreError::CheckpointRegression {
                current,
                requested: block,
            });
        }
        metrics::set_last_indexed_block(block);
        Ok(())
    }

    /// Set the cursor to an arbitrary block, bypassing the monotonic
    /// guard. Every call is logged with the previous value.
    pub async fn force_set(&self, block: u64) -> Result<(), StoreError> {
        let previous = self.load().await?.map(|c| c.last_indexed_block);
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO indexer_checkpoints (indexer_id, last_indexed_block, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (indexer_id) DO UPDATE \
                 SET last_indexed_block = EXCLUDED.last_indexed_block, updated_at = now()",
                &[&self.indexer_id, &(block as i64)],
            )
            .await?;
        match previous {
            Some(prev) => warn!(
                indexer_id = %self.indexer_id,
                previous = prev,
                new = block,
                "checkpoint forcibly overridden"
            ),
            None => info!(
                indexer_id = %self.indexer_id,
                new = block,
                "checkpoint initialized"
            ),
        }
        metrics::set_last_indexed_block(block);
        Ok(())
    }
}
