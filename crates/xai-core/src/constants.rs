//! Protocol constants. All monetary values in base units (1 XAI = 10^8 units).

pub const COIN: u64 = 100_000_000;

/// Hard supply cap: 121M XAI (premine included).
pub const MAX_SUPPLY: u64 = 121_000_000 * COIN;

pub const INITIAL_BLOCK_REWARD: u64 = 12 * COIN;
pub const HALVING_INTERVAL: u64 = 262_800;
pub const BLOCK_TIME_SECS: u64 = 120;
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;
pub const MAX_DIFFICULTY_CHANGE: u32 = 4;
pub const MAINNET_INITIAL_DIFFICULTY: u32 = 4;
pub const TESTNET_INITIAL_DIFFICULTY: u32 = 2;
pub const MEDIAN_TIME_SPAN: usize = 11;
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 3600;
pub const COINBASE_MATURITY: u64 = 100;

pub const MAX_BLOCK_SIZE: usize = 1_048_576;
pub const MAX_TRANSACTIONS_PER_BLOCK: usize = 5_000;
pub const MAX_TX_SIZE: usize = 100_000;

pub const MEMPOOL_MAX_SIZE: usize = 10_000;
pub const MEMPOOL_MAX_PER_SENDER: usize = 100;
/// Minimum fee rate in milli-units per serialized byte.
pub const MEMPOOL_MIN_FEE_RATE: u64 = 1;
pub const MEMPOOL_MAX_AGE_SECS: u64 = 3_600;
pub const MEMPOOL_RBF_MIN_FEE_BUMP: u64 = 1;
pub const MEMPOOL_INVALID_THRESHOLD: u32 = 3;
pub const MEMPOOL_INVALID_WINDOW_SECS: u64 = 900;
pub const MEMPOOL_INVALID_BAN_SECS: u64 = 900;

pub const MAX_REORG_DEPTH: u64 = 100;
pub const MAX_ORPHAN_BLOCKS: usize = 200;
pub const MAX_ORPHAN_TXS: usize = 1_000;
pub const ORPHAN_TX_EXPIRY_SECS: i64 = 86_400;

pub const CHECKPOINT_INTERVAL: u64 = 1_000;
pub const MAX_CHECKPOINTS: usize = 10;

/// Fraction of total voting power (in percent) required for finality.
pub const FINALITY_QUORUM_PERCENT: u64 = 67;

pub const MAINNET_ADDRESS_PREFIX: &str = "XAI";
pub const TESTNET_ADDRESS_PREFIX: &str = "TXAI";
/// Sentinel sender address used by coinbase transactions.
pub const COINBASE_SENDER: &str = "COINBASE";
/// Hex characters in the address payload (20 bytes of SHA-256).
pub const ADDRESS_PAYLOAD_HEX_LEN: usize = 40;

pub const FAUCET_AMOUNT: u64 = 100 * COIN;
