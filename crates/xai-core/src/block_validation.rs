//! Block validation.
//!
//! Two levels:
//!
//! - **Structural** ([`validate_block_structure`]): context-free checks on
//!   version, coinbase position, transaction structure, merkle commitment,
//!   size caps, proof-of-work against the header's own difficulty, and the
//!   optional miner signature.
//! - **Contextual** ([`validate_block`]): linkage to the expected parent,
//!   expected difficulty for the attachment path, median-time-past and
//!   future-drift timestamp rules, per-transaction UTXO/nonce validation
//!   with intra-block double-spend detection, exact coinbase equality, and
//!   the supply cap.
//!
//! `get_utxo` must present the state *before* this block; spending an output
//! created in the same block is not permitted.

use std::collections::HashSet;

use crate::config::Config;
use crate::crypto;
use crate::difficulty::meets_difficulty;
use crate::error::{BlockError, TransactionError};
use crate::merkle;
use crate::nonce::NonceTracker;
use crate::types::{Block, Hash256, OutPoint, UtxoEntry};
use crate::validation;

/// Chain-state inputs required for full block validation.
///
/// The caller derives these from the path the block would attach to — the
/// canonical chain for tip extension, the candidate path during a reorg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    /// Height the block would occupy.
    pub height: u64,
    /// Hash of the parent header.
    pub prev_hash: Hash256,
    /// Median of the previous `median_time_span` timestamps on the
    /// attachment path. `None` exempts the block (genesis only).
    pub median_time_past: Option<i64>,
    /// Expected difficulty at this height on the attachment path.
    pub expected_difficulty: u32,
    /// Wall-clock time used for the future-drift bound.
    pub current_time: i64,
    /// Base subsidy for this height from the halving schedule.
    pub block_reward: u64,
    /// Total coinbase issuance on the attachment path so far.
    pub current_supply: u64,
}

/// Summary of a successfully validated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Sum of all non-coinbase fees.
    pub total_fees: u64,
    /// Total value of the coinbase outputs.
    pub coinbase_value: u64,
}

/// Context-free block checks.
pub fn validate_block_structure(block: &Block, config: &Config) -> Result<(), BlockError> {
    let header = &block.header;

    if !config.allowed_header_versions.contains(&header.version) {
        return Err(BlockError::InvalidVersion(header.version));
    }

    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }

    if block.transactions.len() > config.max_transactions_per_block {
        return Err(BlockError::TooManyTransactions {
            count: block.transactions.len(),
            max: config.max_transactions_per_block,
        });
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    let mut txid_vec = Vec::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        if i > 0 && tx.is_coinbase() {
            return Err(BlockError::MultipleCoinbase);
        }
        validation::validate_transaction_structure(tx, config)
            .map_err(|source| BlockError::TransactionInvalid { index: i, source })?;
        let txid = tx.txid();
        if !txids.insert(txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
        txid_vec.push(txid);
    }

    if header.merkle_root != merkle::merkle_root(&txid_vec) {
        return Err(BlockError::InvalidMerkleRoot);
    }

    let size = block
        .size()
        .map_err(|e| BlockError::Serialization(e.to_string()))?;
    if size > config.max_block_size_bytes {
        return Err(BlockError::OversizedBlock { size, max: config.max_block_size_bytes });
    }

    if !meets_difficulty(&header.hash(), header.difficulty) {
        return Err(BlockError::InvalidPoW);
    }

    crypto::verify_header_signature(header).map_err(|_| BlockError::InvalidHeaderSignature)?;

    Ok(())
}

/// Full contextual validation. Mutates nothing: nonce sequencing is checked
/// against a local copy of the tracker.
pub fn validate_block<F>(
    block: &Block,
    config: &Config,
    context: &BlockContext,
    get_utxo: F,
    nonces: &NonceTracker,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&OutPoint) -> Option<UtxoEntry>,
{
    validate_block_structure(block, config)?;

    let header = &block.header;

    if header.index != context.height {
        return Err(BlockError::InvalidHeight { expected: context.height, got: header.index });
    }
    if header.previous_hash != context.prev_hash {
        return Err(BlockError::InvalidPrevHash);
    }
    if header.difficulty != context.expected_difficulty {
        return Err(BlockError::InvalidDifficulty {
            got: header.difficulty,
            expected: context.expected_difficulty,
        });
    }

    if let Some(median) = context.median_time_past {
        if header.timestamp <= median {
            return Err(BlockError::TimestampBeforeMedian {
                got: header.timestamp,
                median,
            });
        }
    }
    let max_time = context.current_time.saturating_add(config.max_future_block_time);
    if header.timestamp > max_time {
        return Err(BlockError::TimestampTooFar(header.timestamp - context.current_time));
    }

    // Non-coinbase transactions: contextual validation, intra-block
    // double-spend detection, and in-order nonce sequencing.
    let mut block_spent: HashSet<OutPoint> = HashSet::new();
    let mut sequenced = nonces.clone();
    let mut total_fees = 0u64;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        for input in &tx.inputs {
            if !block_spent.insert(input.clone()) {
                return Err(BlockError::DoubleSpend(input.to_string()));
            }
        }

        let validated = validation::validate_transaction(
            tx,
            config,
            &get_utxo,
            context.height,
            None,
        )
        .map_err(|source| BlockError::TransactionInvalid { index: i, source })?;

        if tx.requires_signature() {
            sequenced
                .apply(&tx.sender, tx.nonce)
                .map_err(|source| BlockError::TransactionInvalid { index: i, source })?;
        }

        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or(BlockError::TransactionInvalid {
                index: i,
                source: TransactionError::ValueOverflow,
            })?;
    }

    // Coinbase must claim exactly subsidy + fees, and stay under the cap.
    let coinbase = &block.transactions[0];
    let coinbase_value = coinbase
        .total_output_value()
        .ok_or(BlockError::TransactionInvalid {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;
    let expected = context
        .block_reward
        .checked_add(total_fees)
        .ok_or(BlockError::TransactionInvalid {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;
    if coinbase_value != expected {
        return Err(BlockError::InvalidReward { got: coinbase_value, expected });
    }

    let total_supply = context.current_supply.saturating_add(coinbase_value);
    if total_supply > config.max_supply {
        return Err(BlockError::SupplyCapExceeded {
            total: total_supply,
            max: config.max_supply,
        });
    }

    Ok(ValidatedBlock { total_fees, coinbase_value })
}
