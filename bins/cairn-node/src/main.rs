//! Cairn chain-state node binary.
//!
//! Opens the chain state, optionally reindexes or imports bootstrap block
//! files in the background, and keeps the state consistent on disk until
//! Ctrl+C.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use cairn_core::constants::NetworkType;
use cairn_core::mempool::Mempool;
use cairn_node_lib::{run_import, Chainstate, ChainstateConfig, Collaborators, FlushMode, ImportSource};

#[derive(Parser, Debug)]
#[command(name = "cairn-node", version, about = "Cairn chain-state node")]
struct Args {
    /// Data directory for block files and databases
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Network to run on (mainnet, testnet, regtest)
    #[arg(long, value_parser = ["mainnet", "testnet", "regtest"])]
    network: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Rebuild the block index and coin database from the block files
    #[arg(long)]
    reindex: bool,

    /// Bootstrap block files to import (comma-separated)
    #[arg(long, value_delimiter = ',')]
    import: Vec<PathBuf>,

    /// Script verification threads (0 = one per core)
    #[arg(long)]
    script_threads: Option<usize>,

    /// Maintain a transaction index
    #[arg(long)]
    txindex: bool,
}

impl Args {
    /// Layer CLI overrides over the loaded configuration.
    fn apply(&self, mut config: ChainstateConfig) -> ChainstateConfig {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        match self.network.as_deref() {
            Some("testnet") => config.network = NetworkType::Testnet,
            Some("regtest") => config.network = NetworkType::Regtest,
            Some(_) => config.network = NetworkType::Mainnet,
            None => {}
        }
        if let Some(n) = self.script_threads {
            config.script_threads = n;
        }
        if self.txindex {
            config.txindex = true;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    if let Err(e) = run(args).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = ChainstateConfig::load(args.config.as_deref()).context("loading configuration")?;
    let config = args.apply(config);

    info!("Cairn node v{}", env!("CARGO_PKG_VERSION"));
    info!(
        network = config.network.data_dir_suffix(),
        data_dir = %config.data_dir.display(),
        txindex = config.txindex,
        "starting"
    );

    if args.reindex {
        Chainstate::prepare_reindex(&config).context("preparing reindex")?;
    }
    let mempool = Arc::new(Mutex::new(Mempool::with_defaults()));
    let collab = Collaborators {
        mempool: mempool.clone(),
        ..Collaborators::default()
    };
    let chainstate = Chainstate::open(config, collab).context("opening chain state")?;

    let mut sources = Vec::new();
    if chainstate.is_reindexing()? {
        sources.push(ImportSource::Reindex);
    }
    if !args.import.is_empty() {
        sources.push(ImportSource::Files(args.import.clone()));
    }

    let import = {
        let cs = Arc::clone(&chainstate);
        tokio::task::spawn_blocking(move || {
            for source in sources {
                if cs.shutdown_requested() {
                    break;
                }
                run_import(&cs, source)?;
            }
            cs.activate_best_chain(None)
        })
    };

    let tip = chainstate.active_tip();
    info!(height = tip.height, hash = %tip.hash, "Cairn node running (Ctrl+C to stop)");

    tokio::signal::ctrl_c().await.context("installing Ctrl+C handler")?;
    info!("received Ctrl+C, shutting down...");
    chainstate.request_shutdown();

    match import.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "background import stopped with error"),
        Err(e) => warn!(error = %e, "background import task panicked"),
    }

    chainstate.flush_state(FlushMode::Always).context("final flush")?;
    for w in chainstate.warnings() {
        warn!(warning = %w, "active warning at shutdown");
    }
    let tip = chainstate.active_tip();
    info!(
        height = tip.height,
        hash = %tip.hash,
        mempool_txs = mempool.lock().len(),
        "Cairn node shutdown complete"
    );
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
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
