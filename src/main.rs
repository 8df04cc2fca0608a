//! Application entry-point for the event indexer.
//!
//! 1. Load configuration, initialise tracing.
//! 2. Connect Postgres, ensure the schema, build the RPC manager.
//! 3. Dispatch the chosen subcommand: the live pipeline, a bounded
//!    backfill, a status report, or an explicit checkpoint override.
//! 4. Clean two-phase shutdown: Ctrl-C cancels the token, the in-flight
//!    window commits, side tasks drain.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use eyre::{Context, eyre};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use marketsync::{
    checkpoint::CheckpointStore,
    config::IndexerConfig,
    database,
    indexer::Indexer,
    rpc::RpcManager,
    status::{self, StatusContext},
    types::{IndexerMode, StatusSnapshot},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Prediction market event indexer", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config/indexer.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the live indexing pipeline.
    Run,
    /// Re-scan a historical block range. Persists idempotently and never
    /// touches the checkpoint, so it is safe next to a live indexer.
    Backfill {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Print checkpoint, chain head and lag as JSON.
    Status,
    /// Forcibly set the checkpoint, bypassing the monotonic guard.
    /// Moving it backwards re-indexes; moving it forwards skips events.
    SetCheckpoint {
        #[arg(long)]
        block: u64,
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    let config = IndexerConfig::from_file(&cli.config)
        .await
        .wrap_err_with(|| format!("failed to load config from {}", cli.config.display()))?;
    config.validate()?;

    init_tracing(&config)?;
    info!(indexer_id = %config.indexer_id, "marketsync starting");

    match cli.command {
        Command::Run => run_pipeline(config).await,
        Command::Backfill { from, to } => run_backfill(config, from, to).await,
        Command::Status => print_status(config).await,
        Command::SetCheckpoint { block, yes } => set_checkpoint(config, block, yes).await,
    }
}

fn init_tracing(config: &IndexerConfig) -> eyre::Result<()> {
    // RUST_LOG wins; the config level is the fallback. Dependency spam is
    // demoted either way.
    let base = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(config.log_level.as_deref().unwrap_or("info")),
    };
    let filter = base
        .add_directive("ethers_providers=warn".parse()?)
        .add_directive("ethers=warn".parse()?)
        .add_directive("tokio_postgres=warn".parse()?)
        .add_directive("warp=warn".parse()?)
        .add_directive("hyper=warn".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

async fn run_pipeline(config: IndexerConfig) -> eyre::Result<()> {
    let pool = database::connect_pool(&config.database)
        .await
        .wrap_err("database connection failed")?;
    database::ensure_schema(&pool)
        .await
        .wrap_err("schema setup failed")?;
    let rpc = Arc::new(RpcManager::from_config(&config.rpc)?);

    let shutdown = CancellationToken::new();
    let indexer = Arc::new(Indexer::new(&config, pool, rpc.clone(), shutdown.clone()));

    let monitor = indexer.build_monitor(&config);
    let monitor_handle = tokio::spawn(monitor.clone().run(shutdown.child_token()));

    let status_handle = match &config.status {
        Some(status_cfg) => {
            let listen_addr: SocketAddr = status_cfg
                .listen_addr
                .parse()
                .wrap_err_with(|| format!("invalid status.listen_addr {:?}", status_cfg.listen_addr))?;
            let ctx = StatusContext {
                indexer_id: config.indexer_id.clone(),
                rpc: rpc.clone(),
                monitor: monitor.clone(),
                controls: indexer.pacing_controls(),
                checkpoint_rx: indexer.checkpoint_watch(),
            };
            Some(status::spawn(ctx, listen_addr, shutdown.child_token()))
        }
        None => None,
    };

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, finishing the in-flight window");
            signal_token.cancel();
        }
    });

    let result = indexer.run().await;
    // Covers the error path; on Ctrl-C the token is already cancelled.
    shutdown.cancel();
    let _ = monitor_handle.await;
    if let Some(handle) = status_handle {
        let _ = handle.await;
    }
    result.map_err(eyre::Report::from)
}

async fn run_backfill(config: IndexerConfig, from: u64, to: u64) -> eyre::Result<()> {
    let pool = database::connect_pool(&config.database)
        .await
        .wrap_err("database connection failed")?;
    database::ensure_schema(&pool)
        .await
        .wrap_err("schema setup failed")?;
    let rpc = Arc::new(RpcManager::from_config(&config.rpc)?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("SIGINT received, stopping the backfill after the current window");
            signal_token.cancel();
        }
    });

    let indexer = Indexer::new(&config, pool, rpc, shutdown);
    let summary = indexer.run_backfill(from, to).await?;
    info!(
        windows = summary.windows,
        events_scanned = summary.events_scanned,
        events_written = summary.events_written,
        "backfill summary"
    );
    Ok(())
}

async fn print_status(config: IndexerConfig) -> eyre::Result<()> {
    let pool = database::connect_pool(&config.database)
        .await
        .wrap_err("database connection failed")?;
    let checkpoints = CheckpointStore::new(pool, config.indexer_id.clone());
    let checkpoint = checkpoints.load().await?;

    let rpc = RpcManager::from_config(&config.rpc)?;
    let chain_head = rpc.block_number().await?;
    let last_indexed_block = checkpoint.map(|cp| cp.last_indexed_block).unwrap_or(0);

    let snapshot = StatusSnapshot {
        indexer_id: config.indexer_id.clone(),
        last_indexed_block,
        chain_head,
        lag_blocks: chain_head.saturating_sub(last_indexed_block),
        mode: IndexerMode::Normal,
        blocks_per_second: None,
        endpoints: rpc.endpoint_statuses().await,
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn set_checkpoint(config: IndexerConfig, block: u64, yes: bool) -> eyre::Result<()> {
    if !yes {
        return Err(eyre!(
            "set-checkpoint bypasses the monotonic guard; pass --yes to confirm"
        ));
    }
    let pool = database::connect_pool(&config.database)
        .await
        .wrap_err("database connection failed")?;
    database::ensure_schema(&pool)
        .await
        .wrap_err("schema setup failed")?;
    let checkpoints = CheckpointStore::new(pool, config.indexer_id.clone());
    let previous = checkpoints.load().await?.map(|cp| cp.last_indexed_block);
    checkpoints.force_set(block).await?;
    info!(?previous, new = block, "checkpoint overridden");
    Ok(())
}
