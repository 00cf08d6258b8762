//! Consensus engine: block contexts, templates, and mining.
//!
//! The engine is a set of pure functions over a header path (genesis up to
//! the intended parent). The blockchain facade calls them under its chain
//! lock for tip extension, and the reorg manager calls them per-block while
//! walking a candidate path — the same rules apply to both, so fork
//! validation cannot drift from tip validation.

use std::sync::atomic::{AtomicBool, Ordering};

use xai_core::address::Address;
use xai_core::block_validation::BlockContext;
use xai_core::config::Config;
use xai_core::difficulty::{self, meets_difficulty, ChainWork};
use xai_core::error::BlockError;
use xai_core::merkle;
use xai_core::reward;
use xai_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput, TxType};

/// Build the [`BlockContext`] for the block that would extend `ancestors`.
///
/// `ancestors` is the attachment path from genesis to the intended parent,
/// in height order. `current_supply` is the coinbase issuance on that path;
/// `current_time` feeds the future-drift bound.
pub fn context_for_next(
    config: &Config,
    ancestors: &[BlockHeader],
    current_supply: u64,
    current_time: i64,
) -> BlockContext {
    let parent = ancestors.last().expect("path contains at least genesis");
    let height = parent.index + 1;

    let span = config.median_time_span.min(ancestors.len());
    let window: Vec<i64> = ancestors[ancestors.len() - span..]
        .iter()
        .map(|h| h.timestamp)
        .collect();

    BlockContext {
        height,
        prev_hash: parent.hash(),
        median_time_past: difficulty::median_time_past(&window),
        expected_difficulty: difficulty::expected_difficulty(
            config,
            height,
            parent.difficulty,
            |h| ancestors[h as usize].timestamp,
        ),
        current_time,
        block_reward: reward::block_reward(config, height),
        current_supply,
    }
}

/// Cumulative work of a header path.
pub fn cumulative_work(headers: &[BlockHeader]) -> ChainWork {
    headers.iter().fold(ChainWork::ZERO, |acc, h| {
        acc.saturating_add(ChainWork::block_work(h.difficulty))
    })
}

/// Build a coinbase transaction for `height` paying `reward_plus_fees` to
/// `payout`.
///
/// The height rides in the nonce field so coinbase txids are unique per
/// block even for identical payouts.
pub fn build_coinbase(
    payout: &Address,
    height: u64,
    reward_plus_fees: u64,
    timestamp: i64,
) -> Transaction {
    Transaction {
        sender: Address::coinbase(),
        recipient: payout.clone(),
        amount: reward_plus_fees,
        fee: 0,
        public_key: vec![],
        nonce: height,
        tx_type: TxType::Coinbase,
        timestamp,
        inputs: vec![],
        outputs: vec![TxOutput { address: payout.clone(), amount: reward_plus_fees }],
        signature: None,
        rbf_enabled: false,
        replaces_txid: None,
    }
}

/// Assemble a block template extending `ancestors`.
///
/// `candidates` are pre-validated mempool transactions with their fees, in
/// the selection order the mempool produced. Entries that would double-spend
/// within the template, claim to be coinbase, or overflow the block size are
/// skipped rather than failing the template — the miner should not stall on
/// stale pool entries.
pub fn create_block_template(
    config: &Config,
    ancestors: &[BlockHeader],
    current_supply: u64,
    payout: &Address,
    candidates: &[(Transaction, u64)],
    timestamp: i64,
) -> Result<Block, BlockError> {
    let context = context_for_next(config, ancestors, current_supply, timestamp);

    // A valid timestamp must clear the median of the recent ancestors.
    let timestamp = match context.median_time_past {
        Some(median) => timestamp.max(median + 1),
        None => timestamp,
    };

    let mut included: Vec<Transaction> = Vec::new();
    let mut spent: std::collections::HashSet<&OutPoint> = std::collections::HashSet::new();
    let mut total_fees = 0u64;
    // Leave room for the header and coinbase.
    let mut budget = config.max_block_size_bytes.saturating_sub(1024);

    for (tx, fee) in candidates {
        if tx.is_coinbase() {
            continue;
        }
        if included.len() + 2 > config.max_transactions_per_block {
            break;
        }
        let size = match tx.size() {
            Ok(s) if s <= budget => s,
            _ => continue,
        };
        if tx.inputs.iter().any(|i| spent.contains(i)) {
            continue;
        }
        spent.extend(tx.inputs.iter());
        budget -= size;
        total_fees = total_fees.saturating_add(*fee);
        included.push(tx.clone());
    }

    let coinbase_value = context
        .block_reward
        .checked_add(total_fees)
        .ok_or(BlockError::InvalidReward { got: u64::MAX, expected: context.block_reward })?;
    let coinbase = build_coinbase(payout, context.height, coinbase_value, timestamp);

    let mut transactions = Vec::with_capacity(1 + included.len());
    transactions.push(coinbase);
    transactions.extend(included);

    let txids: Vec<Hash256> = transactions.iter().map(|t| t.txid()).collect();

    Ok(Block {
        header: BlockHeader {
            index: context.height,
            previous_hash: context.prev_hash,
            merkle_root: merkle::merkle_root(&txids),
            timestamp,
            difficulty: context.expected_difficulty,
            nonce: 0,
            version: 1,
            miner_pubkey: None,
            signature: None,
        },
        transactions,
    })
}

/// Grind the nonce until the header hash meets its difficulty.
///
/// Checks `stop` between attempts; returns `false` when interrupted or when
/// `max_nonce` is exhausted. On success the winning nonce is left in the
/// header.
pub fn mine_block(block: &mut Block, max_nonce: u64, stop: &AtomicBool) -> bool {
    for nonce in 0..=max_nonce {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        block.header.nonce = nonce;
        if meets_difficulty(&block.header.hash(), block.header.difficulty) {
            return true;
        }
    }
    false
}
