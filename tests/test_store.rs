mod common;

use chrono::Utc;
use deadpool_postgres::Pool;
use ethers::types::H256;
use eyre::Result;
use serde_json::json;

use marketsync::checkpoint::CheckpointStore;
use marketsync::config::DatabaseConfig;
use marketsync::database::{self, EXPECTED_SCHEMA_VERSION};
use marketsync::errors::StoreError;
use marketsync::persister::EventPersister;
use marketsync::types::{EventKind, IndexedEvent};

/// Connect to the database named by DATABASE_URL, or skip the test when
/// the variable is unset.
async fn test_pool() -> Option<Pool> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => url,
        _ => {
            eprintln!("DATABASE_URL not set, skipping store test");
            return None;
        }
    };
    let cfg = DatabaseConfig {
        url,
        max_pool_size: Some(4),
        connect_timeout_secs: Some(5),
    };
    let pool = database::connect_pool(&cfg).await.expect("database connection");
    database::ensure_schema(&pool).await.expect("schema setup");
    Some(pool)
}

fn sample_event(block: u64, log_index: u64, seed: u8) -> IndexedEvent {
    IndexedEvent {
        block_number: block,
        transaction_hash: H256::repeat_byte(seed),
        log_index,
        event_kind: EventKind::TicketPurchased,
        contract_address: common::market_address(),
        payload: json!({
            "market_id": "7",
            "buyer": "0x4242424242424242424242424242424242424242",
            "outcome": 2,
            "amount": "1000000000000000000",
        }),
        tx_status: 1,
        observed_at: Utc::now(),
    }
}

#[tokio::test]
async fn persist_is_idempotent_on_replay() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let persister = EventPersister::new(pool.clone());

    // Block range reserved for this test; clear any previous run.
    let (from, to) = (9_000_000u64, 9_000_099u64);
    let client = pool.get().await?;
    client
        .execute(
            "DELETE FROM market_events WHERE block_number BETWEEN $1 AND $2",
            &[&(from as i64), &(to as i64)],
        )
        .await?;
    drop(client);

    let events = vec![
        sample_event(9_000_001, 0, 0xd1),
        sample_event(9_000_001, 1, 0xd1),
        sample_event(9_000_007, 4, 0xd2),
    ];
    assert_eq!(persister.persist(&events).await?, 3);

    // Replaying the same window is a no-op.
    assert_eq!(persister.persist(&events).await?, 0);
    assert_eq!(persister.count_in_range(from, to).await?, 3);

    // An overlapping batch only inserts the genuinely new row.
    let mut overlap = events[1..].to_vec();
    overlap.push(sample_event(9_000_012, 0, 0xd3));
    assert_eq!(persister.persist(&overlap).await?, 1);
    assert_eq!(persister.count_in_range(from, to).await?, 4);

    persister.verify_event(&events[2]).await?;
    Ok(())
}

#[tokio::test]
async fn checkpoint_advance_is_monotonic() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    let store = CheckpointStore::new(pool, format!("store-test-{}", rand::random::<u32>()));

    store.advance(100).await?;
    assert_eq!(
        store.load().await?.expect("checkpoint").last_indexed_block,
        100
    );

    // Re-committing the same block is idempotent, not a regression.
    store.advance(100).await?;

    match store.advance(90).await {
        Err(StoreError::CheckpointRegression { current, requested }) => {
            assert_eq!(current, 100);
            assert_eq!(requested, 90);
        }
        other => panic!("expected CheckpointRegression, got {:?}", other),
    }
    assert_eq!(
        store.load().await?.expect("checkpoint").last_indexed_block,
        100
    );

    // Rewinds only happen through the explicit override.
    store.force_set(50).await?;
    assert_eq!(
        store.load().await?.expect("checkpoint").last_indexed_block,
        50
    );
    Ok(())
}

#[tokio::test]
async fn schema_version_matches_binary() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let Some(pool) = test_pool().await else {
        return Ok(());
    };
    assert_eq!(
        database::schema_version(&pool).await?,
        Some(EXPECTED_SCHEMA_VERSION)
    );
    EventPersister::new(pool).check_schema_contract().await?;
    Ok(())
}
