use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ethers::types::{
    Address, Filter, FilterBlockOption, Log, TransactionReceipt, ValueOrArray, H256, U64,
};

use marketsync::errors::RpcError;
use marketsync::rpc::RpcTransport;

// === Mock RPC Transport ===

/// Scriptable in-memory endpoint. Knobs sit behind `Arc` so a test can keep
/// one handle while the connection manager owns a clone, and counters expose
/// what the manager actually did.
#[derive(Debug, Clone)]
pub struct MockTransport {
    head: Arc<RwLock<u64>>,
    logs: Arc<RwLock<Vec<Log>>>,
    receipts: Arc<RwLock<HashMap<H256, TransactionReceipt>>>,
    max_range: Arc<RwLock<Option<u64>>>,
    fail_next: Arc<RwLock<u32>>,
    failure_message: Arc<RwLock<String>>,
    head_calls: Arc<AtomicU32>,
    log_calls: Arc<AtomicU32>,
    receipt_calls: Arc<AtomicU32>,
}

impl MockTransport {
    pub fn new(head: u64) -> Self {
        Self {
            head: Arc::new(RwLock::new(head)),
            logs: Arc::new(RwLock::new(Vec::new())),
            receipts: Arc::new(RwLock::new(HashMap::new())),
            max_range: Arc::new(RwLock::new(None)),
            fail_next: Arc::new(RwLock::new(0)),
            failure_message: Arc::new(RwLock::new(String::new())),
            head_calls: Arc::new(AtomicU32::new(0)),
            log_calls: Arc::new(AtomicU32::new(0)),
            receipt_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_head(&self, block: u64) {
        *self.head.write().unwrap() = block;
    }

    pub fn push_log(&self, log: Log) {
        self.logs.write().unwrap().push(log);
    }

    /// Register a receipt for `tx`; `success` maps to status 1, else 0.
    pub fn set_receipt(&self, tx: H256, success: bool) {
        let receipt = TransactionReceipt {
            transaction_hash: tx,
            status: Some(U64::from(u64::from(success))),
            ..Default::default()
        };
        self.receipts.write().unwrap().insert(tx, receipt);
    }

    /// Reject `eth_getLogs` whenever the requested width exceeds `width`.
    pub fn set_max_range(&self, width: Option<u64>) {
        *self.max_range.write().unwrap() = width;
    }

    /// Fail the next `count` calls, whatever the method, with `message`.
    pub fn fail_next_calls(&self, count: u32, message: &str) {
        *self.fail_next.write().unwrap() = count;
        *self.failure_message.write().unwrap() = message.to_string();
    }

    pub fn head_calls(&self) -> u32 {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub fn log_calls(&self) -> u32 {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn receipt_calls(&self) -> u32 {
        self.receipt_calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<RpcError> {
        let mut remaining = self.fail_next.write().unwrap();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(RpcError::Provider(
            self.failure_message.read().unwrap().clone(),
        ))
    }
}

fn filter_bounds(filter: &Filter) -> (u64, u64) {
    match filter.block_option {
        FilterBlockOption::Range {
            from_block,
            to_block,
        } => {
            let from = from_block
                .and_then(|b| b.as_number())
                .map(|n| n.as_u64())
                .unwrap_or(0);
            let to = to_block
                .and_then(|b| b.as_number())
                .map(|n| n.as_u64())
                .unwrap_or(u64::MAX);
            (from, to)
        }
        FilterBlockOption::AtBlockHash(_) => (0, u64::MAX),
    }
}

fn filter_topic0(filter: &Filter) -> Option<H256> {
    match &filter.topics[0] {
        Some(ValueOrArray::Value(Some(topic))) => Some(*topic),
        _ => None,
    }
}

fn filter_address(filter: &Filter) -> Option<Address> {
    match &filter.address {
        Some(ValueOrArray::Value(addr)) => Some(*addr),
        _ => None,
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn block_number(&self) -> Result<u64, RpcError> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(*self.head.read().unwrap())
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        let (from, to) = filter_bounds(filter);
        if let Some(max) = *self.max_range.read().unwrap() {
            let width = to.saturating_sub(from) + 1;
            if width > max {
                return Err(RpcError::Provider(format!(
                    "query returned more than 10000 results, block range is too large: {} > {}",
                    width, max
                )));
            }
        }
        let topic0 = filter_topic0(filter);
        let address = filter_address(filter);
        let logs = self
            .logs
            .read()
            .unwrap()
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
                block >= from
                    && block <= to
                    && topic0.map_or(true, |t| log.topics.first() == Some(&t))
                    && address.map_or(true, |a| log.address == a)
            })
            .cloned()
            .collect();
        Ok(logs)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.receipt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted_failure() {
            return Err(err);
        }
        Ok(self.receipts.read().unwrap().get(&hash).cloned())
    }
}
