// src/status.rs

//! HTTP status surface: `GET /status` serializes a [`StatusSnapshot`] of
//! the running indexer and `GET /metrics` serves the Prometheus text
//! exposition. Both routes are read-only views over shared handles; the
//! server never blocks or mutates the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warp::{Filter, Reply};

use crate::lag::{LagMonitor, PacingControls};
use crate::metrics;
use crate::rpc::RpcManager;
use crate::types::StatusSnapshot;

/// Shared handles the status routes read from. Cheap to clone per request.
#[derive(Clone)]
pub struct StatusContext {
    pub indexer_id: String,
    pub rpc: Arc<RpcManager>,
    pub monitor: Arc<LagMonitor>,
    pub controls: Arc<PacingControls>,
    pub checkpoint_rx: watch::Receiver<u64>,
}

impl StatusContext {
    pub async fn snapshot(&self) -> StatusSnapshot {
        let last_indexed_block = *self.checkpoint_rx.borrow();
        let chain_head = self
            .monitor
            .latest_sample()
            .await
            .map(|sample| sample.chain_head)
            .unwrap_or(last_indexed_block);
        StatusSnapshot {
            indexer_id: self.indexer_id.clone(),
            last_indexed_block,
            chain_head,
            lag_blocks: chain_head.saturating_sub(last_indexed_block),
            mode: self.controls.mode().await,
            blocks_per_second: self.monitor.smoothed_throughput().await,
            endpoints: self.rpc.endpoint_statuses().await,
        }
    }
}

/// Starts the status server on its own task. Shuts down cleanly when the
/// token fires; a bind failure is logged and surfaced through the handle
/// rather than taking the pipeline down.
pub fn spawn(ctx: StatusContext, listen_addr: SocketAddr, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctx_filter = warp::any().map(move || ctx.clone());

        let status_route = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .and(ctx_filter)
            .and_then(status_handler);
        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and_then(metrics_handler);
        let routes = status_route.or(metrics_route);

        let server = warp::serve(routes).try_bind_with_graceful_shutdown(listen_addr, async move {
            shutdown.cancelled().await;
        });
        match server {
            Ok((addr, fut)) => {
                info!(%addr, "status server listening");
                fut.await;
                info!("status server stopped");
            }
            Err(err) => {
                error!(error = %err, %listen_addr, "status server failed to bind");
            }
        }
    })
}

async fn status_handler(ctx: StatusContext) -> Result<warp::reply::Response, warp::Rejection> {
    let snapshot = ctx.snapshot().await;
    Ok(warp::reply::json(&snapshot).into_response())
}

async fn metrics_handler() -> Result<warp::reply::Response, warp::Rejection> {
    match metrics::encode_text() {
        Ok(body) => {
            let response = warp::reply::with_header(
                body,
                "Content-Type",
                "text/plain; version=0.0.4",
            );
            Ok(response.into_response())
        }
        Err(err) => {
            error!(error = %err, "Failed to encode metrics");
            let response = warp::reply::with_status(
                "Failed to encode metrics".to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            );
            Ok(response.into_response())
        }
    }
}
