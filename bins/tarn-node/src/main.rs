//! Tarn chain-state node binary.
//!
//! Opens the chain-state engine over RocksDB, aligns the UTXO tip with the
//! stored header chain, runs the background prune loop, and flushes all
//! state on Ctrl+C.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tarn_state::{ChainStateEngine, ConsensusVariant, PruneService, StateConfig};
use tokio::sync::watch;
use tracing::{error, info};

/// Tarn chain-state node — a prunable, reorg-safe UTXO state engine.
#[derive(Parser, Debug)]
#[command(
    name = "tarn-node",
    version,
    about = "Tarn chain-state node with RocksDB storage and background pruning"
)]
struct Args {
    /// Data directory for chain storage
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Deepest reorg served by the fast rewind path
    #[arg(long, default_value_t = tarn_core::constants::MAX_REORG_LENGTH)]
    max_reorg_length: u64,

    /// Number of recent block bodies kept when pruning
    #[arg(long, default_value_t = tarn_core::constants::BLOCKS_TO_KEEP)]
    blocks_to_keep: u64,

    /// Seconds between prune passes
    #[arg(long, default_value_t = tarn_core::constants::PRUNE_INTERVAL_SECS)]
    prune_interval_secs: u64,

    /// Disable the background prune loop
    #[arg(long)]
    no_prune: bool,

    /// Run the proof-of-stake rule variant instead of proof-of-work
    #[arg(long)]
    proof_of_stake: bool,

    /// Minimum stake depth for the proof-of-stake variant
    #[arg(long, default_value_t = 500, requires = "proof_of_stake")]
    min_stake_depth: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Convert CLI args into a StateConfig plus the consensus variant.
    fn into_config(self) -> (StateConfig, ConsensusVariant, String, String, bool) {
        let default_data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tarn");
        let data_dir = self.data_dir.unwrap_or(default_data_dir);

        let config = StateConfig {
            data_dir,
            max_reorg_length: self.max_reorg_length,
            blocks_to_keep: self.blocks_to_keep,
            prune_interval_secs: self.prune_interval_secs,
        };
        let variant = if self.proof_of_stake {
            ConsensusVariant::ProofOfStake {
                min_stake_depth: self.min_stake_depth,
            }
        } else {
            ConsensusVariant::ProofOfWork
        };
        (config, variant, self.log_level, self.log_format, self.no_prune)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, variant, log_level, log_format, no_prune) = args.into_config();

    init_logging(&log_level, &log_format);

    info!("Tarn chain-state node v{}", env!("CARGO_PKG_VERSION"));
    info!("variant: {:?}", variant);
    info!("data_dir: {:?}", config.data_dir);
    info!(
        "pruning: keep {} bodies, reorg window {}, every {}s",
        config.blocks_to_keep, config.max_reorg_length, config.prune_interval_secs
    );

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    // Open the stores and align the UTXO tip with the header chain.
    let engine = match ChainStateEngine::open(variant, &config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to open chain state: {}", e);
            process::exit(1);
        }
    };

    let chain_tip = engine.tree().read().tip_pair();
    let tip = match engine.initialize(&chain_tip) {
        Ok(tip) => tip,
        Err(e) => {
            error!("chain state initialization failed: {}", e);
            process::exit(1);
        }
    };
    info!(
        "utxo tip: height={} hash={}",
        tip.height,
        hex::encode(tip.hash.as_bytes())
    );

    // Background prune loop with cooperative shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let prune_handle = if no_prune {
        info!("pruning disabled");
        None
    } else {
        let service = Arc::new(PruneService::new(
            engine.tree(),
            engine.cache(),
            engine.chain_db(),
            &config,
        ));
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move { service.run(rx).await }))
    };

    info!("Tarn node running (Ctrl+C to stop)");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    info!("received Ctrl+C, shutting down...");

    // Let the prune loop finish its in-flight pass.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = prune_handle {
        let _ = handle.await;
    }

    // Flush headers and coin state; skipping this loses the staged blocks.
    if let Err(e) = engine.shutdown() {
        error!("shutdown flush failed: {}", e);
        process::exit(1);
    }
    info!("Tarn node shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output (suitable for log
/// aggregation pipelines). Any other value defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
