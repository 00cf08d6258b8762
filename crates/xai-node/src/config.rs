//! Node configuration: data directory layout and protocol parameters.

use std::path::PathBuf;

use xai_core::config::Config;

/// Configuration for a full node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Protocol and policy parameters.
    pub chain: Config,
    /// Log level filter string (e.g. "info", "xai_node=debug").
    pub log_level: String,
}

impl NodeConfig {
    /// Testnet node rooted at the platform data directory.
    pub fn testnet_default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("xai")
            .join("testnet");
        Self {
            data_dir,
            chain: Config::testnet(),
            log_level: "info".to_string(),
        }
    }

    /// Node rooted at an explicit directory (used by tests).
    pub fn at(data_dir: impl Into<PathBuf>, chain: Config) -> Self {
        Self {
            data_dir: data_dir.into(),
            chain,
            log_level: "info".to_string(),
        }
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.bin")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reorg_wal.json")
    }

    pub fn finality_dir(&self) -> PathBuf {
        self.data_dir.join("finality")
    }

    pub fn address_index_path(&self) -> PathBuf {
        self.data_dir.join("address_index.db")
    }

    pub fn validators_path(&self) -> PathBuf {
        self.data_dir.join("validators.json")
    }
}
