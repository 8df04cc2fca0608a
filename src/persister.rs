// src/persister.rs

//! # Event Persister
//!
//! Writes validated events into `market_events` with insert-or-ignore
//! semantics on the natural key, one transaction per scan window. The
//! statement shape adapts to the columns actually present on the target
//! table, so a deployment that has not run the latest migration degrades
//! to the columns it has instead of failing every batch.

use deadpool_postgres::Pool;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, warn};

use crate::database::{self, EXPECTED_SCHEMA_VERSION};
use crate::errors::StoreError;
use crate::metrics;
use crate::types::IndexedEvent;

/// How the store's schema version relates to what this binary expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaCompat {
    /// Versions match.
    Current,
    /// Store is behind, or has no version row; the column probe narrows
    /// the insert shape.
    Probe,
    /// Store is ahead of this binary; refuse to write.
    Ahead(i32),
}

fn schema_compat(found: Option<i32>, expected: i32) -> SchemaCompat {
    match found {
        Some(v) if v == expected => SchemaCompat::Current,
        Some(v) if v > expected => SchemaCompat::Ahead(v),
        _ => SchemaCompat::Probe,
    }
}

/// Which optional columns exist on `market_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnShape {
    has_tx_status: bool,
    has_observed_at: bool,
}

impl ColumnShape {
    fn full() -> Self {
        Self {
            has_tx_status: true,
            has_observed_at: true,
        }
    }

    fn insert_sql(&self) -> String {
        let mut columns = vec![
            "block_number",
            "transaction_hash",
            "log_index",
            "event_kind",
            "contract_address",
            "payload",
        ];
        if self.has_tx_status {
            columns.push("tx_status");
        }
        if self.has_observed_at {
            columns.push("observed_at");
        }
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
        format!(
            "INSERT INTO market_events ({}) VALUES ({}) \
             ON CONFLICT (block_number, transaction_hash, log_index, event_kind) DO NOTHING",
            columns.join(", "),
            placeholders.join(", ")
        )
    }
}

pub struct EventPersister {
    pool: Pool,
    column_shape: tokio::sync::OnceCell<ColumnShape>,
}

impl EventPersister {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            column_shape: tokio::sync::OnceCell::new(),
        }
    }

    /// Compare the store's schema version against what this binary was
    /// built for. An older store is tolerated (the column probe narrows
    /// the insert); a newer store refuses to start rather than write
    /// shapes this code does not understand.
    pub async fn check_schema_contract(&self) -> Result<(), StoreError> {
        let found = database::schema_version(&self.pool).await?;
        match schema_compat(found, EXPECTED_SCHEMA_VERSION) {
            SchemaCompat::Current => {
                debug!(version = EXPECTED_SCHEMA_VERSION, "schema version matches");
                Ok(())
            }
            SchemaCompat::Probe => {
                match found {
                    Some(v) => warn!(
                        found = v,
                        expected = EXPECTED_SCHEMA_VERSION,
                        "store schema is behind this binary; writing probed columns only"
                    ),
                    None => warn!("store has no schema_version table; relying on column probe"),
                }
                Ok(())
            }
            SchemaCompat::Ahead(v) => Err(StoreError::SchemaVersion {
                expected: EXPECTED_SCHEMA_VERSION,
                found: v,
            }),
        }
    }

    /// Persist a batch inside one transaction. Returns the number of rows
    /// actually inserted; duplicates of already-stored events count zero.
    pub async fn persist(&self, events: &[IndexedEvent]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let shape = *self.column_shape().await?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare(&shape.insert_sql()).await?;

        let mut written = 0usize;
        for event in events {
            let block_number = event.block_number as i64;
            let transaction_hash = format!("{:#x}", event.transaction_hash);
            let log_index = event.log_index as i64;
            let event_kind = event.event_kind.as_str();
            let contract_address = format!("{:#x}", event.contract_address);

            let mut params: Vec<&(dyn ToSql + Sync)> = vec![
                &block_number,
                &transaction_hash,
                &log_index,
                &event_kind,
                &contract_address,
                &event.payload,
            ];
            if shape.has_tx_status {
                params.push(&event.tx_status);
            }
            if shape.has_observed_at {
                params.push(&event.observed_at);
            }
            written += tx.execute(&stmt, &params).await? as usize;
        }
        tx.commit().await?;

        let duplicates = events.len() - written;
        if duplicates > 0 {
            debug!(written, duplicates, "batch contained already-stored events");
        }
        metrics::add_events_persisted(written as u64, duplicates as u64);
        Ok(written)
    }

    /// Re-read one just-written event by natural key and confirm the JSON
    /// payload round-tripped. Reconciliation tooling calls this; the hot
    /// path does not.
    pub async fn verify_event(&self, event: &IndexedEvent) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT payload FROM market_events \
                 WHERE block_number = $1 AND transaction_hash = $2 \
                   AND log_index = $3 AND event_kind = $4",
                &[
                    &(event.block_number as i64),
                    &format!("{:#x}", event.transaction_hash),
                    &(event.log_index as i64),
                    &event.event_kind.as_str(),
                ],
            )
            .await?;
        match row {
            None => Err(StoreError::VerificationFailed {
                key: event.key_string(),
                reason: "row not found".to_string(),
            }),
            Some(row) => {
                let stored: serde_json::Value = row.get(0);
                if stored == event.payload {
                    Ok(())
                } else {
                    Err(StoreError::VerificationFailed {
                        key: event.key_string(),
                        reason: "payload mismatch".to_string(),
                    })
                }
            }
        }
    }

    /// Count stored events in an inclusive block range, for reconciliation
    /// after backfills.
    pub async fn count_in_range(&self, from: u64, to: u64) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM market_events WHERE block_number BETWEEN $1 AND $2",
                &[&(from as i64), &(to as i64)],
            )
            .await?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn column_shape(&self) -> Result<&ColumnShape, StoreError> {
        self.column_shape
            .get_or_try_init(|| async {
                let client = self.pool.get().await?;
                let rows = client
                    .query(
                        "SELECT column_name FROM information_schema.columns \
                         WHERE table_name = 'market_events'",
                        &[],
                    )
                    .await?;
                let mut shape = ColumnShape {
                    has_tx_status: false,
                    has_observed_at: false,
                };
                for row in &rows {
                    match row.get::<_, &str>(0) {
                        "tx_status" => shape.has_tx_status = true,
                        "observed_at" => shape.has_observed_at = true,
                        _ => {}
                    }
                }
                if shape != ColumnShape::full() {
                    warn!(
                        has_tx_status = shape.has_tx_status,
                        has_observed_at = shape.has_observed_at,
                        "market_events is missing optional columns; narrowing inserts"
                    );
                } else {
                    info!("market_events has the full column set");
                }
                Ok(shape)
            })
            .await
    }
}
