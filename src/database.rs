// src/database.rs

//! # Database Pool
//!
//! Builds the Postgres connection pool from configuration and bootstraps
//! the schema on startup. The pool is constructed once in main and handed
//! to each component; nothing in this crate reaches for a global
//! connection.

use deadpool_postgres::{Config as PgConfig, Pool, PoolConfig, Runtime};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::errors::StoreError;

/// Current shape of the store as created by [`ensure_schema`]. Version 1
/// deployments lack the `tx_status` and `observed_at` columns; the
/// persister probes for them instead of assuming.
pub const EXPECTED_SCHEMA_VERSION: i32 = 2;

/// Parse the connection URL, build the pool, and verify connectivity with
/// a round-trip query.
pub async fn connect_pool(cfg: &DatabaseConfig) -> Result<Pool, StoreError> {
    let url = url::Url::parse(&cfg.url)
        .map_err(|e| StoreError::Config(format!("invalid database url: {}", e)))?;
    if url.scheme() != "postgres" && url.scheme() != "postgresql" {
        return Err(StoreError::Config(format!(
            "invalid database scheme '{}', expected postgres",
            url.scheme()
        )));
    }

    let mut pg_config = PgConfig::new();
    pg_config.host = Some(
        url.host_str()
            .ok_or_else(|| StoreError::Config("database url missing host".to_string()))?
            .to_string(),
    );
    pg_config.port = Some(url.port().unwrap_or(5432));
    pg_config.user = Some(if url.username().is_empty() {
        "postgres".to_string()
    } else {
        url.username().to_string()
    });
    pg_config.password = url.password().map(|p| p.to_string());
    pg_config.dbname = Some(url.path().trim_start_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| Some("postgres".to_string()));

    let mut pool_config = PoolConfig::new(cfg.max_pool_size());
    pool_config.timeouts.wait = Some(Duration::from_secs(cfg.connect_timeout_secs()));
    pool_config.timeouts.create = Some(Duration::from_secs(cfg.connect_timeout_secs()));
    pg_config.pool = Some(pool_config);

    let pool = pg_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Config(format!("failed to create pool: {}", e)))?;

    let client = pool.get().await?;
    client.simple_query("SELECT 1").await?;
    info!(
        host = pg_config.host.as_deref().unwrap_or("?"),
        dbname = pg_config.dbname.as_deref().unwrap_or("?"),
        pool_size = cfg.max_pool_size(),
        "database pool ready"
    );
    Ok(pool)
}

/// Create the tables this indexer needs when they do not exist. Existing
/// tables are left untouched, so an older deployment keeps its shape and
/// the persister's column probe decides what can be written.
pub async fn ensure_schema(pool: &Pool) -> Result<(), StoreError> {
    let client = pool.get().await?;
    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS market_events (
                id               BIGSERIAL PRIMARY KEY,
                block_number     BIGINT NOT NULL,
                transaction_hash TEXT NOT NULL,
                log_index        BIGINT NOT NULL,
                event_kind       TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                payload          JSONB NOT NULL,
                tx_status        SMALLINT NOT NULL DEFAULT 1,
                observed_at      TIMESTAMPTZ NOT NULL DEFAULT now()
            );
            CREATE UNIQUE INDEX IF NOT EXISTS market_events_natural_key
                ON market_events (block_number, transaction_hash, log_index, event_kind);
            CREATE INDEX IF NOT EXISTS market_events_kind_block
                ON market_events (event_kind, block_number);

            CREATE TABLE IF NOT EXISTS indexer_checkpoints (
                indexer_id         TEXT PRIMARY KEY,
                last_indexed_block BIGINT NOT NULL,
                updated_at         TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );
            "#,
        )
        .await?;

    // Seed the version row once; never overwrite what migrations manage.
    client
        .execute(
            "INSERT INTO schema_version (version)
             SELECT $1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
            &[&EXPECTED_SCHEMA_VERSION],
        )
        .await?;
    Ok(())
}

/// Read the store's schema version. `None` when the version table is
/// missing entirely (a pre-versioning deployment).
pub async fn schema_version(pool: &Pool) -> Result<Option<i32>, StoreError> {
    let client = pool.get().await?;
    let exists = client
        .query_one(
            "SELECT EXISTS (
                 SELECT 1 FROM information_schema.tables
                 WHERE table_name = 'schema_version'
             )",
            &[],
        )
        .await?;
    if !exists.get::<_, bool>(0) {
        return Ok(None);
    }
    let row = client
        .query_opt("SELECT version FROM schema_version LIMIT 1", &[])
        .await?;
    Ok(row.map(|r| r.get::<_, i32>(0)))
}
