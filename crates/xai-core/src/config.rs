//! Immutable protocol configuration.
//!
//! A [`Config`] value is constructed once at startup and threaded by
//! reference into every component that needs it. There is no global state;
//! two nodes in the same process may run with different configurations
//! (used heavily by the integration tests).

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::types::Hash256;

/// Which network the node participates in.
///
/// Mainnet disallows test-only behaviors (faucet, trivial difficulty) and
/// enforces required values at startup.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Address prefix for this network (`XAI` / `TXAI`).
    pub fn address_prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_ADDRESS_PREFIX,
            Network::Testnet => TESTNET_ADDRESS_PREFIX,
        }
    }
}

/// Protocol and policy parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub network: Network,

    // Consensus
    pub target_block_time: u64,
    pub difficulty_adjustment_interval: u64,
    pub max_difficulty_change: u32,
    pub initial_difficulty: u32,
    pub median_time_span: usize,
    pub max_future_block_time: i64,
    pub allowed_header_versions: Vec<u32>,

    // Emission
    pub halving_interval: u64,
    pub initial_block_reward: u64,
    pub max_supply: u64,
    pub coinbase_maturity: u64,

    // Block caps
    pub max_block_size_bytes: usize,
    pub max_transactions_per_block: usize,

    // Mempool policy
    pub mempool_max_size: usize,
    pub mempool_max_per_sender: usize,
    pub mempool_min_fee_rate: u64,
    pub mempool_max_age_secs: u64,
    pub mempool_rbf_min_fee_bump: u64,
    pub mempool_invalid_threshold: u32,
    pub mempool_invalid_window_secs: u64,
    pub mempool_invalid_ban_secs: u64,

    // Fork-choice safety
    pub max_reorg_depth: u64,
    pub max_orphan_blocks: usize,

    // Checkpoints
    pub checkpoint_interval: u64,
    pub max_checkpoints: usize,

    // Finality
    pub finality_quorum_percent: u64,

    // Test-only faucet
    pub faucet_amount: u64,

    /// Expected genesis hash; startup fails if the local genesis differs.
    pub expected_genesis_hash: Option<Hash256>,
}

impl Config {
    /// Production configuration.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            target_block_time: BLOCK_TIME_SECS,
            difficulty_adjustment_interval: DIFFICULTY_ADJUSTMENT_INTERVAL,
            max_difficulty_change: MAX_DIFFICULTY_CHANGE,
            initial_difficulty: MAINNET_INITIAL_DIFFICULTY,
            median_time_span: MEDIAN_TIME_SPAN,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            allowed_header_versions: vec![1],
            halving_interval: HALVING_INTERVAL,
            initial_block_reward: INITIAL_BLOCK_REWARD,
            max_supply: MAX_SUPPLY,
            coinbase_maturity: COINBASE_MATURITY,
            max_block_size_bytes: MAX_BLOCK_SIZE,
            max_transactions_per_block: MAX_TRANSACTIONS_PER_BLOCK,
            mempool_max_size: MEMPOOL_MAX_SIZE,
            mempool_max_per_sender: MEMPOOL_MAX_PER_SENDER,
            mempool_min_fee_rate: MEMPOOL_MIN_FEE_RATE,
            mempool_max_age_secs: MEMPOOL_MAX_AGE_SECS,
            mempool_rbf_min_fee_bump: MEMPOOL_RBF_MIN_FEE_BUMP,
            mempool_invalid_threshold: MEMPOOL_INVALID_THRESHOLD,
            mempool_invalid_window_secs: MEMPOOL_INVALID_WINDOW_SECS,
            mempool_invalid_ban_secs: MEMPOOL_INVALID_BAN_SECS,
            max_reorg_depth: MAX_REORG_DEPTH,
            max_orphan_blocks: MAX_ORPHAN_BLOCKS,
            checkpoint_interval: CHECKPOINT_INTERVAL,
            max_checkpoints: MAX_CHECKPOINTS,
            finality_quorum_percent: FINALITY_QUORUM_PERCENT,
            faucet_amount: 0,
            expected_genesis_hash: None,
        }
    }

    /// Testnet configuration: easier difficulty, faucet enabled.
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            initial_difficulty: TESTNET_INITIAL_DIFFICULTY,
            faucet_amount: FAUCET_AMOUNT,
            ..Self::mainnet()
        }
    }

    /// Whether faucet transactions are accepted.
    pub fn faucet_enabled(&self) -> bool {
        self.network == Network::Testnet && self.faucet_amount > 0
    }

    /// Validate the configuration at startup.
    ///
    /// Mainnet requires production difficulty and a disabled faucet; all
    /// networks require sane interval and quorum values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network == Network::Mainnet {
            if self.initial_difficulty < MAINNET_INITIAL_DIFFICULTY {
                return Err(ConfigError::InvalidOption(format!(
                    "mainnet initial difficulty must be >= {MAINNET_INITIAL_DIFFICULTY}"
                )));
            }
            if self.faucet_amount != 0 {
                return Err(ConfigError::InvalidOption(
                    "faucet must be disabled on mainnet".into(),
                ));
            }
        }
        if self.target_block_time == 0 {
            return Err(ConfigError::InvalidOption("target_block_time must be > 0".into()));
        }
        if self.difficulty_adjustment_interval < 2 {
            return Err(ConfigError::InvalidOption(
                "difficulty_adjustment_interval must be >= 2".into(),
            ));
        }
        if self.max_difficulty_change < 2 {
            return Err(ConfigError::InvalidOption(
                "max_difficulty_change must be >= 2".into(),
            ));
        }
        if self.median_time_span == 0 {
            return Err(ConfigError::InvalidOption("median_time_span must be > 0".into()));
        }
        if self.allowed_header_versions.is_empty() {
            return Err(ConfigError::InvalidOption(
                "allowed_header_versions must not be empty".into(),
            ));
        }
        if self.finality_quorum_percent == 0 || self.finality_quorum_percent > 100 {
            return Err(ConfigError::InvalidOption(
                "finality_quorum_percent must be in 1..=100".into(),
            ));
        }
        if self.max_reorg_depth == 0 {
            return Err(ConfigError::InvalidOption("max_reorg_depth must be > 0".into()));
        }
        Ok(())
    }
}
