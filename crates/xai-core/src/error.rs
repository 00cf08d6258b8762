//! Error types for the XAI protocol.
//!
//! Each component has its own error enum; [`ChainError`] is the transparent
//! umbrella used at crate boundaries. [`ErrorKind`] classifies every error
//! into the coarse categories surfaced to peers and telemetry, and
//! [`RejectReason`] is the user-visible rejection payload.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("invalid amount")] InvalidAmount,
    #[error("malformed address: {0}")] InvalidAddress(String),
    #[error("txid does not match transaction contents")] TxidMismatch,
    #[error("missing signature")] MissingSignature,
    #[error("invalid signature")] InvalidSignature,
    #[error("sender does not match signing key: {0}")] SenderMismatch(String),
    #[error("unknown UTXO: {0}")] UnknownUtxo(String),
    #[error("input {0} not owned by sender")] InputNotOwned(usize),
    #[error("duplicate input: {0}")] DuplicateInput(String),
    #[error("insufficient inputs: have {have}, need {need}")] InsufficientInputs { have: u64, need: u64 },
    #[error("outputs must sum to inputs minus fee: expected {expected}, got {got}")] OutputMismatch { expected: u64, got: u64 },
    #[error("nonce mismatch for {sender}: expected {expected}, got {got}")] NonceMismatch { sender: String, expected: u64, got: u64 },
    #[error("immature coinbase UTXO at input {index}")] ImmatureCoinbase { index: usize },
    #[error("empty outputs")] EmptyOutputs,
    #[error("oversized: {size} > {max}")] OversizedTransaction { size: usize, max: usize },
    #[error("value overflow")] ValueOverflow,
    #[error("invalid coinbase: {0}")] InvalidCoinbase(String),
    #[error("faucet transactions are disabled on this network")] FaucetDisabled,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("header hash does not match contents")] HashMismatch,
    #[error("insufficient proof of work")] InvalidPoW,
    #[error("unknown header version: {0}")] InvalidVersion(u32),
    #[error("invalid merkle root")] InvalidMerkleRoot,
    #[error("invalid header signature")] InvalidHeaderSignature,
    #[error("oversized block: {size} > {max}")] OversizedBlock { size: usize, max: usize },
    #[error("too many transactions: {count} > {max}")] TooManyTransactions { count: usize, max: usize },
    #[error("no coinbase")] NoCoinbase,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("duplicate txid: {0}")] DuplicateTxid(String),
    #[error("double spend across transactions: {0}")] DoubleSpend(String),
    #[error("invalid prev hash")] InvalidPrevHash,
    #[error("invalid height: expected {expected}, got {got}")] InvalidHeight { expected: u64, got: u64 },
    #[error("invalid difficulty: got {got}, expected {expected}")] InvalidDifficulty { got: u32, expected: u32 },
    #[error("timestamp {got} not after median time past {median}")] TimestampBeforeMedian { got: i64, median: i64 },
    #[error("timestamp too far in future: {0}s ahead")] TimestampTooFar(i64),
    #[error("invalid coinbase total: got {got}, expected {expected}")] InvalidReward { got: u64, expected: u64 },
    #[error("supply cap exceeded: {total} > {max}")] SupplyCapExceeded { total: u64, max: u64 },
    #[error("tx error at index {index}: {source}")] TransactionInvalid { index: usize, source: TransactionError },
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error("pool full")] PoolFull,
    #[error("fee rate too low: {rate} < minimum {minimum}")] FeeRateTooLow { rate: u64, minimum: u64 },
    #[error("sender {sender} exceeds per-sender cap of {cap}")] SenderCapExceeded { sender: String, cap: usize },
    #[error("sender {sender} is banned until {until}")] SenderBanned { sender: String, until: i64 },
    #[error("replace-by-fee rejected: {0}")] RbfRejected(String),
    #[error("internal: {0}")] Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UtxoError {
    #[error("missing UTXO: {0}")] MissingUtxo(String),
    #[error("double spend: {0}")] DoubleSpend(String),
    #[error("lock conflict: {0}")] LockConflict(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForkError {
    #[error("reorg depth {depth} exceeds maximum {max}")] ReorgTooDeep { depth: u64, max: u64 },
    #[error("fork point {fork} at or below checkpoint height {checkpoint}")] ForkBeforeCheckpoint { fork: u64, checkpoint: u64 },
    #[error("fork point {fork} at or below finalized height {finalized}")] ForkBeforeFinalized { fork: u64, finalized: u64 },
    #[error("candidate chain is not heavier than the current chain")] NotHeavier,
    #[error("candidate chain invalid: {0}")] InvalidCandidate(String),
    #[error("no common ancestor with the current chain")] UnknownAncestor,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FinalityError {
    #[error("validator not in set: {0}")] UnknownValidator(String),
    #[error("invalid finality vote signature")] InvalidVoteSignature,
    #[error("block not found: {0}")] UnknownBlock(String),
    #[error("invalid validator set: {0}")] InvalidValidatorSet(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mainnet requires {0} to be set")] MissingMainnetValue(String),
    #[error("genesis hash mismatch: expected {expected}, got {got}")] GenesisHashMismatch { expected: String, got: String },
    #[error("invalid option: {0}")] InvalidOption(String),
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Mempool(#[from] MempoolError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] Utxo(#[from] UtxoError),
    #[error(transparent)] Fork(#[from] ForkError),
    #[error(transparent)] Finality(#[from] FinalityError),
    #[error(transparent)] Config(#[from] ConfigError),
    #[error("storage: {0}")] Storage(String),
}

/// Coarse classification of a rejection, stable across error detail changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Crypto,
    Economic,
    State,
    Policy,
    Time,
    Fork,
    Storage,
    Configuration,
}

impl ChainError {
    /// Classify this error into its [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChainError::Transaction(e) => match e {
                TransactionError::InvalidAmount
                | TransactionError::InvalidAddress(_)
                | TransactionError::EmptyOutputs
                | TransactionError::DuplicateInput(_)
                | TransactionError::OversizedTransaction { .. }
                | TransactionError::ValueOverflow
                | TransactionError::InvalidCoinbase(_)
                | TransactionError::Serialization(_) => ErrorKind::Structural,
                TransactionError::TxidMismatch
                | TransactionError::MissingSignature
                | TransactionError::InvalidSignature
                | TransactionError::SenderMismatch(_) => ErrorKind::Crypto,
                TransactionError::InsufficientInputs { .. }
                | TransactionError::OutputMismatch { .. } => ErrorKind::Economic,
                TransactionError::UnknownUtxo(_)
                | TransactionError::InputNotOwned(_)
                | TransactionError::NonceMismatch { .. }
                | TransactionError::ImmatureCoinbase { .. } => ErrorKind::State,
                TransactionError::FaucetDisabled => ErrorKind::Policy,
            },
            ChainError::Block(e) => match e {
                BlockError::HashMismatch
                | BlockError::InvalidPoW
                | BlockError::InvalidMerkleRoot
                | BlockError::InvalidHeaderSignature => ErrorKind::Crypto,
                BlockError::InvalidReward { .. } | BlockError::SupplyCapExceeded { .. } => {
                    ErrorKind::Economic
                }
                BlockError::TimestampBeforeMedian { .. } | BlockError::TimestampTooFar(_) => {
                    ErrorKind::Time
                }
                BlockError::DoubleSpend(_) => ErrorKind::State,
                BlockError::TransactionInvalid { source, .. } => {
                    ChainError::Transaction(source.clone()).kind()
                }
                _ => ErrorKind::Structural,
            },
            ChainError::Mempool(_) => ErrorKind::Policy,
            ChainError::Crypto(_) => ErrorKind::Crypto,
            ChainError::Utxo(_) => ErrorKind::State,
            ChainError::Fork(_) => ErrorKind::Fork,
            ChainError::Finality(e) => match e {
                FinalityError::InvalidVoteSignature => ErrorKind::Crypto,
                _ => ErrorKind::State,
            },
            ChainError::Config(_) => ErrorKind::Configuration,
            ChainError::Storage(_) => ErrorKind::Storage,
        }
    }
}

/// User-visible rejection payload: `{accepted: false, reason, detail}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectReason {
    pub kind: ErrorKind,
    pub detail: String,
}

impl From<&ChainError> for RejectReason {
    fn from(err: &ChainError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}
