//! XAI full node binary.
//!
//! Opens the chain (creating genesis on first run), optionally starts the
//! background miner, and runs until Ctrl+C. Transport and RPC adapters
//! attach through the library's listener interfaces; this binary is the
//! minimal standalone configuration.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use xai_core::address::Address;
use xai_core::config::Config;
use xai_core::genesis::{GenesisProvider, GenesisSpec};
use xai_node::miner::Miner;
use xai_node::{Blockchain, NodeConfig};

/// XAI full node.
#[derive(Parser, Debug)]
#[command(name = "xai-node", version, about = "XAI proof-of-work full node")]
struct Args {
    /// Data directory for chain storage
    #[arg(long, default_value = None)]
    data_dir: Option<PathBuf>,

    /// Connect to mainnet instead of the default testnet
    #[arg(long)]
    mainnet: bool,

    /// Mine blocks, paying rewards to this address
    #[arg(long)]
    mine_to: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> (NodeConfig, Option<String>) {
        let chain = if self.mainnet { Config::mainnet() } else { Config::testnet() };
        let suffix = if self.mainnet { "mainnet" } else { "testnet" };
        let data_dir = self.data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("xai")
                .join(suffix)
        });
        let mut config = NodeConfig::at(data_dir, chain);
        config.log_level = self.log_level;
        (config, self.mine_to)
    }
}

fn main() {
    let args = Args::parse();
    let (config, mine_to) = args.into_config();

    init_logging(&config.log_level);

    info!("XAI Full Node v{}", env!("CARGO_PKG_VERSION"));
    info!("network: {:?}", config.chain.network);
    info!("data_dir: {:?}", config.data_dir);

    let payout = match mine_to {
        Some(raw) => {
            match Address::parse(config.chain.network.address_prefix(), &raw) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    error!("invalid --mine-to address: {e}");
                    process::exit(1);
                }
            }
        }
        None => None,
    };

    let provider = GenesisProvider::Spec(GenesisSpec::standard(&config.chain));
    let chain = match Blockchain::open(&config, &provider) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            error!("failed to open chain: {e}");
            process::exit(1);
        }
    };

    info!(height = chain.height(), tip = %chain.tip_hash(), "chain ready");

    let miner = payout.map(|addr| {
        info!(payout = %addr, "starting miner");
        Miner::start(Arc::clone(&chain), addr)
    });

    info!("node running (Ctrl+C to stop)");
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    ctrlc_handler(tx);
    let _ = rx.recv();

    info!("shutting down");
    if let Some(miner) = miner {
        miner.stop();
    }
    info!("shutdown complete");
}

/// Minimal Ctrl+C hook without an extra dependency.
fn ctrlc_handler(tx: std::sync::mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let mut buf = String::new();
        // Blocks until stdin closes (Ctrl+C terminates the process via the
        // default handler; closing stdin gives a clean path in containers).
        let _ = std::io::stdin().read_line(&mut buf);
        let _ = tx.send(());
    });
}

fn init_logging(level_str: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_level(true))
        .init();
}
