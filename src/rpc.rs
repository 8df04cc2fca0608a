// src/rpc.rs

//! # RPC Connection Manager
//!
//! Owns the weighted set of upstream endpoints and exposes the three calls
//! the pipeline needs: chain head, logs in a range, and transaction
//! receipts. Every call goes through one retry wrapper that handles
//! endpoint selection, per-endpoint circuit breaking, request budgets,
//! bounded deadlines, and exponential backoff with jitter.
//!
//! Two error classes deliberately bypass the retry machinery:
//! - `RangeTooLarge` returns immediately so the scanner can halve its
//!   window instead of burning retries.
//! - `NoHealthyEndpoint` returns immediately when every circuit is open;
//!   the main loop owns the extended backoff for that condition.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, Filter, Log, TransactionReceipt, H256};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::errors::RpcError;
use crate::metrics;
use crate::types::{CircuitState, EndpointStatus};

//================================================================================================//
//                                   Error Classification                                         //
//================================================================================================//

/// Provider responses that mean "your block range is too wide", across the
/// major RPC vendors. Matched case-insensitively against the error text.
const RANGE_LIMIT_ERROR_PATTERNS: &[&str] = &[
    "too many logs",
    "block range is too large",
    "range too large",
    "exceeds max block range",
    "query returned more than",
    "response size exceeded",
    "-32005",
];

/// Provider responses that mean "slow down", not "broken".
const RATE_LIMIT_ERROR_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limited",
    "too many requests",
    "429",
    "quota exceeded",
    "throttled",
];

pub fn is_range_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RANGE_LIMIT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Exponential backoff with jitter. The shift is capped so repeated retries
/// level out at `max_delay` instead of overflowing.
pub fn backoff_with_jitter(
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
) -> Duration {
    let exp = attempt.min(8);
    let delay = base_delay
        .saturating_mul(2u32.saturating_pow(exp))
        .min(max_delay);
    let jitter = delay.mul_f64(jitter_factor.clamp(0.0, 1.0) * rand::thread_rng().gen::<f64>());
    (delay + jitter).min(max_delay.mul_f64(1.0 + jitter_factor))
}

//================================================================================================//
//                                        Transport                                               //
//================================================================================================//

/// The raw calls an endpoint must answer. Production uses an `ethers` HTTP
/// provider; tests inject scripted implementations.
#[async_trait]
pub trait RpcTransport: Send + Sync + fmt::Debug {
    async fn block_number(&self) -> Result<u64, RpcError>;
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError>;
    async fn transaction_receipt(&self, hash: H256)
        -> Result<Option<TransactionReceipt>, RpcError>;
}

/// Production transport over HTTP JSON-RPC.
#[derive(Debug)]
pub struct HttpTransport {
    provider: Provider<Http>,
}

impl HttpTransport {
    pub fn connect(url: &str) -> Result<Self, RpcError> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| RpcError::Provider(format!("invalid endpoint url: {}", e)))?;
        Ok(Self { provider })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn block_number(&self) -> Result<u64, RpcError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.provider
            .get_logs(filter)
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| RpcError::Provider(e.to_string()))
    }
}

//================================================================================================//
//                                     Circuit Breaker                                            //
//================================================================================================//

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Set while the single HALF_OPEN probe is outstanding.
    probe_in_flight: bool,
    trips: u64,
    total_failures: u64,
    total_successes: u64,
}

/// Per-endpoint failure isolation.
///
/// CLOSED admits all traffic. After `failure_threshold` consecutive
/// failures the circuit OPENs and the endpoint is skipped. Once
/// `cooldown` elapses the circuit moves to HALF_OPEN and admits exactly
/// one probe call: success closes the circuit, failure re-opens it with a
/// fresh cool-down. A probe that ends rate-limited settles nothing; its
/// slot is released and the circuit stays HALF_OPEN for the next caller.
#[derive(Debug)]
pub struct EndpointCircuit {
    inner: Mutex<CircuitInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl EndpointCircuit {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                trips: 0,
                total_failures: 0,
                total_successes: 0,
            }),
            failure_threshold,
            cooldown,
        }
    }

    /// Whether a call may be issued right now. Acquiring in HALF_OPEN
    /// claims the probe slot, so concurrent callers cannot double-probe.
    pub async fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!(cooldown_secs = self.cooldown.as_secs(), "circuit entering half-open probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes = inner.total_successes.saturating_add(1);
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!("circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.probe_in_flight = false;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures = inner.total_failures.saturating_add(1);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                inner.trips = inner.trips.saturating_add(1);
                warn!("half-open probe failed, circuit re-opened");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trips = inner.trips.saturating_add(1);
                warn!(
                    consecutive_failures = inner.consecutive_failures,
                    threshold = self.failure_threshold,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Returns a claimed HALF_OPEN probe slot without a verdict. Used when
    /// the probe came back rate-limited, which is neither a success nor an
    /// endpoint failure; the next caller may probe again.
    pub async fn release_probe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            debug!("half-open probe released without a verdict");
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock().await;
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
        }
    }
}

/// Point-in-time circuit readout for the status surface.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

//================================================================================================//
//                                     Managed Endpoint                                           //
//================================================================================================//

struct ManagedEndpoint {
    name: String,
    priority: u32,
    transport: Arc<dyn RpcTransport>,
    circuit: EndpointCircuit,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl fmt::Debug for ManagedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedEndpoint")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

//================================================================================================//
//                                        RpcManager                                              //
//================================================================================================//

/// Single logical RPC client over the configured endpoint set. Cloneable
/// via `Arc`; constructed once in main and injected into every consumer.
#[derive(Debug)]
pub struct RpcManager {
    endpoints: Vec<ManagedEndpoint>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    call_timeout: Duration,
}

impl RpcManager {
    /// Build the production manager, one HTTP transport per configured
    /// endpoint, sorted by priority (lower number wins).
    pub fn from_config(cfg: &RpcConfig) -> Result<Self, RpcError> {
        let mut transports: Vec<Arc<dyn RpcTransport>> = Vec::with_capacity(cfg.endpoints.len());
        for ep in &cfg.endpoints {
            transports.push(Arc::new(HttpTransport::connect(&ep.url)?));
        }
        Ok(Self::with_transports(cfg, transports))
    }

    /// Build a manager over injected transports. This is the seam tests use
    /// to substitute scripted endpoints; configuration still drives
    /// priorities, budgets, and circuit tuning.
    pub fn with_transports(cfg: &RpcConfig, transports: Vec<Arc<dyn RpcTransport>>) -> Self {
        let threshold = cfg.circuit_failure_threshold();
        let cooldown = Duration::from_secs(cfg.circuit_cooldown_secs());
        let mut endpoints: Vec<ManagedEndpoint> = cfg
            .endpoints
            .iter()
            .zip(transports)
            .enumerate()
            .map(|(i, (ep, transport))| {
                let limiter = ep.requests_per_second.and_then(NonZeroU32::new).map(|rps| {
                    RateLimiter::direct(Quota::per_second(rps))
                });
                ManagedEndpoint {
                    name: ep.display_name(i),
                    priority: ep.priority.unwrap_or(i as u32),
                    transport,
                    circuit: EndpointCircuit::new(threshold, cooldown),
                    limiter,
                }
            })
            .collect();
        endpoints.sort_by_key(|ep| ep.priority);
        info!(
            endpoints = endpoints.len(),
            circuit_threshold = threshold,
            cooldown_secs = cooldown.as_secs(),
            "rpc manager initialized"
        );
        Self {
            endpoints,
            max_retries: cfg.max_retries(),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms()),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms()),
            jitter_factor: cfg.jitter_factor(),
            call_timeout: Duration::from_secs(cfg.call_timeout_secs()),
        }
    }

    /// Current chain head.
    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.execute("eth_blockNumber", |t| async move { t.block_number().await })
            .await
    }

    /// Logs for one (contract, topic0) pair over an inclusive block range.
    /// Range rejections surface as [`RpcError::RangeTooLarge`].
    pub async fn logs_in_range(
        &self,
        contract: Address,
        topic0: H256,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let filter = Filter::new()
            .address(contract)
            .topic0(topic0)
            .from_block(from)
            .to_block(to);
        self.execute("eth_getLogs", move |t| {
            let filter = filter.clone();
            async move {
                t.get_logs(&filter).await.map_err(|e| match e {
                    RpcError::Provider(msg) if is_range_limit_error(&msg) => {
                        RpcError::RangeTooLarge {
                            from,
                            to,
                            message: msg,
                        }
                    }
                    other => other,
                })
            }
        })
        .await
    }

    /// Receipt for one transaction, `None` when the node does not know it.
    pub async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.execute("eth_getTransactionReceipt", move |t| async move {
            t.transaction_receipt(hash).await
        })
        .await
    }

    /// Health snapshot for the status surface.
    pub async fn endpoint_statuses(&self) -> Vec<EndpointStatus> {
        let mut out = Vec::with_capacity(self.endpoints.len());
        for ep in &self.endpoints {
            let snap = ep.circuit.snapshot().await;
            metrics::set_circuit_state(&ep.name, snap.state);
            out.push(EndpointStatus {
                name: ep.name.clone(),
                priority: ep.priority,
                circuit_state: snap.state,
                consecutive_failures: snap.consecutive_failures,
                trips: snap.trips,
                total_failures: snap.total_failures,
                total_successes: snap.total_successes,
            });
        }
        out
    }

    /// Retry wrapper shared by all calls: walks endpoints in priority order
    /// (skipping open circuits), applies per-endpoint budgets and the call
    /// deadline, and backs off between whole-set passes.
    async fn execute<T, F, Fut>(&self, method: &'static str, call_fn: F) -> Result<T, RpcError>
    where
        F: Fn(Arc<dyn RpcTransport>) -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut attempt: u32 = 0;
        let mut last_error: Option<RpcError> = None;
        loop {
            let mut tried = 0usize;
            for ep in &self.endpoints {
                if !ep.circuit.try_acquire().await {
                    continue;
                }
                tried += 1;
                if let Some(limiter) = &ep.limiter {
                    limiter.until_ready().await;
                }
                let started = Instant::now();
                let outcome = tokio::time::timeout(self.call_timeout, call_fn(ep.transport.clone())).await;
                match outcome {
                    Ok(Ok(value)) => {
                        ep.circuit.record_success().await;
                        metrics::observe_rpc_call(method, &ep.name, "ok", started.elapsed());
                        return Ok(value);
                    }
                    Ok(Err(mut err)) => {
                        if let RpcError::Provider(msg) = &err {
                            if is_rate_limit_error(msg) {
                                err = RpcError::RateLimited(msg.clone());
                            }
                        }
                        if let RpcError::RangeTooLarge { from, to, .. } = &err {
                            // The endpoint answered; this is a policy
                            // response the scanner reacts to, not a fault.
                            ep.circuit.record_success().await;
                            metrics::observe_rpc_call(method, &ep.name, "range_too_large", started.elapsed());
                            debug!(
                                endpoint = %ep.name,
                                from = from,
                                to = to,
                                "provider rejected log range as too large"
                            );
                            return Err(err);
                        }
                        if err.is_endpoint_failure() {
                            ep.circuit.record_failure().await;
                        } else {
                            // A rate-limited call may be holding the
                            // half-open probe slot; free it.
                            ep.circuit.release_probe().await;
                        }
                        metrics::observe_rpc_call(method, &ep.name, "error", started.elapsed());
                        warn!(
                            endpoint = %ep.name,
                            method = method,
                            error = %err,
                            "rpc call failed"
                        );
                        last_error = Some(err);
                    }
                    Err(_) => {
                        let err = RpcError::Timeout {
                            method: method.to_string(),
                            timeout_ms: self.call_timeout.as_millis() as u64,
                        };
                        ep.circuit.record_failure().await;
                        metrics::observe_rpc_call(method, &ep.name, "timeout", started.elapsed());
                        warn!(
                            endpoint = %ep.name,
                            method = method,
                            timeout_ms = self.call_timeout.as_millis() as u64,
                            "rpc call timed out"
                        );
                        last_error = Some(err);
                    }
                }
            }

            if tried == 0 {
                let mut open = 0usize;
                for ep in &self.endpoints {
                    if ep.circuit.state().await == CircuitState::Open {
                        open += 1;
                    }
                }
                warn!(method = method, open = open, total = self.endpoints.len(), "no healthy rpc endpoint");
                return Err(RpcError::NoHealthyEndpoint {
                    open,
                    total: self.endpoints.len(),
                });
            }

            attempt += 1;
            if attempt > self.max_retries {
                let last = last_error
                    .take()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(RpcError::RetriesExhausted {
                    method: method.to_string(),
                    attempts: attempt,
                    last_error: last,
                });
            }
            let delay = backoff_with_jitter(attempt, self.base_delay, self.max_delay, self.jitter_factor);
            metrics::inc_rpc_retry(method);
            debug!(
                method = method,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "backing off before rpc retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
