#![allow(dead_code)]

use ethers::types::{Address, Bytes, Log, H256, U256, U64};

use marketsync::config::{EndpointConfig, RpcConfig, ScanConfig, ScanTargetConfig};
use marketsync::decoder;
use marketsync::types::EventKind;

pub mod mocks;

/// Contract address shared by every synthetic log and scan target.
pub fn market_address() -> Address {
    Address::repeat_byte(0xaa)
}

/// RPC settings tuned for fast tests: `n` endpoints in priority order,
/// millisecond backoff, no jitter.
pub fn rpc_config(n: usize) -> RpcConfig {
    let endpoints = (0..n)
        .map(|i| EndpointConfig {
            url: format!("http://127.0.0.1:{}", 8545 + i),
            priority: Some(i as u32),
            name: Some(format!("ep{}", i)),
            requests_per_second: None,
        })
        .collect();
    RpcConfig {
        endpoints,
        max_retries: Some(2),
        retry_base_delay_ms: Some(1),
        retry_max_delay_ms: Some(5),
        jitter_factor: Some(0.0),
        call_timeout_secs: Some(5),
        circuit_failure_threshold: Some(3),
        circuit_cooldown_secs: Some(60),
    }
}

/// Scan settings with a single target contract emitting `events`.
pub fn scan_config(events: Vec<EventKind>) -> ScanConfig {
    ScanConfig {
        targets: vec![ScanTargetConfig {
            contract_address: market_address(),
            events,
        }],
        batch_size: Some(500),
        poll_interval_ms: Some(10),
        confirmation_blocks: Some(0),
        max_concurrent_targets: Some(4),
        receipt_cache_size: Some(1_024),
        receipt_cache_ttl_secs: Some(60),
        genesis_block: Some(0),
        error_backoff_secs: Some(1),
    }
}

pub fn h256_from_u256(value: U256) -> H256 {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    H256::from(buf)
}

pub fn h256_from_address(addr: Address) -> H256 {
    let mut buf = [0u8; 32];
    buf[12..].copy_from_slice(addr.as_bytes());
    H256::from(buf)
}

pub fn encode_words(words: &[U256]) -> Bytes {
    let mut data = Vec::with_capacity(words.len() * 32);
    for w in words {
        let mut buf = [0u8; 32];
        w.to_big_endian(&mut buf);
        data.extend_from_slice(&buf);
    }
    Bytes::from(data)
}

fn event_log(
    kind: EventKind,
    extra_topics: Vec<H256>,
    data: Bytes,
    block: u64,
    log_index: u64,
    tx: H256,
) -> Log {
    let mut topics = vec![decoder::topic0(kind)];
    topics.extend(extra_topics);
    Log {
        address: market_address(),
        topics,
        data,
        block_number: Some(U64::from(block)),
        transaction_hash: Some(tx),
        log_index: Some(U256::from(log_index)),
        ..Default::default()
    }
}

/// A decodable TicketPurchased log (market 7, outcome 2, 1e18 wei) at the
/// given chain position.
pub fn purchase_log(block: u64, log_index: u64, tx: H256) -> Log {
    event_log(
        EventKind::TicketPurchased,
        vec![
            h256_from_u256(U256::from(7u64)),
            h256_from_address(Address::repeat_byte(0x42)),
        ],
        encode_words(&[U256::from(2u64), U256::exp10(18)]),
        block,
        log_index,
        tx,
    )
}

/// A decodable Staked log at the given chain position.
pub fn staked_log(block: u64, log_index: u64, tx: H256) -> Log {
    event_log(
        EventKind::Staked,
        vec![h256_from_address(Address::repeat_byte(0x42))],
        encode_words(&[U256::exp10(18), U256::exp10(19)]),
        block,
        log_index,
        tx,
    )
}
