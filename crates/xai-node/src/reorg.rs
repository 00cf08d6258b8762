//! Chain reorganization.
//!
//! A block attaching below the current tip starts a fork candidate. The
//! candidate chain is assembled by walking `previous_hash` links through the
//! orphan pool until a canonical ancestor (the fork point) is found, then
//! evaluated:
//!
//! - depth within `max_reorg_depth`
//! - fork point not below the finalized height or the latest checkpoint
//! - cumulative work strictly greater than the current chain's, with
//!   equal-work ties broken by more transactions, then earlier tip
//!   timestamp; a candidate that loses stays in the orphan pool so a later
//!   child can still outweigh the canonical chain
//!
//! A winning candidate goes through a two-phase commit: snapshot every
//! mutable component and write the WAL record, apply (rewind to the fork
//! point by replaying stored blocks into fresh state, then fully validate
//! and apply each candidate block), revalidate the mempool, and only then
//! touch the disk — truncate the old suffix, write the new blocks, flip the
//! WAL to committed, and delete it. Any failure restores all snapshots in
//! reverse dependency order and records a rolled-back WAL.
//!
//! Crash recovery is the startup path in [`Blockchain::open_with`]: an
//! in-progress WAL discards in-memory state and rebuilds from the on-disk
//! blocks plus the newest checkpoint.

use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use xai_consensus::engine;
use xai_core::error::{ChainError, ForkError};
use xai_core::mempool::MempoolEntry;
use xai_core::traits::TelemetryCounter;
use xai_core::types::{Block, BlockHeader};
use xai_core::validation;

use crate::chain::{apply_block_to_state, BlockDisposition, Blockchain, ChainInner, MempoolState};
use crate::storage::{WalRecord, WalStatus};

/// Walk `previous_hash` links from `block` back through the orphan pool to
/// a canonical ancestor.
///
/// Returns the fork point height and the candidate blocks in height order
/// (ending with `block`). `None` when the lineage leaves known territory or
/// would detach genesis.
pub(crate) fn assemble_candidate(
    chain: &ChainInner,
    block: &Block,
) -> Option<(u64, Vec<Block>)> {
    let mut candidate = vec![block.clone()];
    loop {
        let first = &candidate[0];
        if first.header.index == 0 {
            return None; // genesis is never replaced
        }
        let parent_height = first.header.index - 1;
        let parent_hash = first.header.previous_hash;

        if let Some(header) = chain.headers.get(parent_height as usize) {
            if header.hash() == parent_hash {
                return Some((parent_height, candidate));
            }
        }
        match chain.find_orphan_by_hash(&parent_hash) {
            Some(parent) if parent.header.index == parent_height => {
                candidate.insert(0, parent.clone());
            }
            _ => return None,
        }
    }
}

/// Fork-choice comparison between the current suffix and a candidate.
fn candidate_wins(
    current_suffix: &[BlockHeader],
    current_tx_count: usize,
    candidate: &[Block],
) -> bool {
    let current_work = engine::cumulative_work(current_suffix);
    let candidate_headers: Vec<BlockHeader> =
        candidate.iter().map(|b| b.header.clone()).collect();
    let candidate_work = engine::cumulative_work(&candidate_headers);

    if candidate_work != current_work {
        return candidate_work > current_work;
    }

    let candidate_tx_count: usize = candidate.iter().map(|b| b.transactions.len()).sum();
    if candidate_tx_count != current_tx_count {
        return candidate_tx_count > current_tx_count;
    }

    match (candidate_headers.last(), current_suffix.last()) {
        (Some(c), Some(t)) => c.timestamp < t.timestamp,
        _ => false,
    }
}

struct StateSnapshots {
    headers: Vec<BlockHeader>,
    utxo: xai_core::utxo::UtxoSnapshot,
    nonces: xai_core::nonce::NonceSnapshot,
    supply: u64,
    finality: Option<xai_consensus::finality::FinalityState>,
    mempool: Vec<MempoolEntry>,
}

impl Blockchain {
    /// Evaluate and, if it wins fork choice, execute a reorg onto
    /// `candidate`.
    pub(crate) fn attempt_reorg(
        &self,
        chain: &mut ChainInner,
        fork_height: u64,
        candidate: Vec<Block>,
        now: i64,
    ) -> Result<BlockDisposition, ChainError> {
        let tip_height = chain.tip_height();
        let depth = tip_height - fork_height;

        if depth > self.config.max_reorg_depth {
            return Err(ForkError::ReorgTooDeep { depth, max: self.config.max_reorg_depth }.into());
        }
        if let Some(finality) = &chain.finality {
            if !finality.can_reorg_to_height(fork_height) {
                let finalized = finality.highest_finalized_height().unwrap_or(0);
                return Err(ForkError::ForkBeforeFinalized { fork: fork_height, finalized }.into());
            }
        }
        chain.checkpoints.check_fork_point(fork_height)?;

        // Old suffix blocks, needed for the work comparison, the address
        // index rollback, and (on disk) until commit.
        let mut old_suffix: Vec<Block> = Vec::with_capacity(depth as usize);
        for height in fork_height + 1..=tip_height {
            let block = chain
                .storage
                .read_block(height)?
                .ok_or_else(|| ChainError::Storage(format!("missing block file {height}")))?;
            old_suffix.push(block);
        }
        let current_suffix = &chain.headers[(fork_height + 1) as usize..];
        let current_tx_count: usize = old_suffix.iter().map(|b| b.transactions.len()).sum();

        if !candidate_wins(current_suffix, current_tx_count, &candidate) {
            // Losing forks stay stashed: a later child may tip the balance.
            debug!(fork_height, "candidate does not outweigh current chain; stashing");
            for block in candidate {
                chain.orphan_blocks.insert(block.header.hash(), (block, now));
            }
            return Ok(BlockDisposition::Orphaned);
        }

        let old_tip_hash = chain.tip().hash();
        let new_tip_hash = candidate.last().expect("candidate non-empty").header.hash();
        let connected = candidate.len() as u64;

        info!(
            fork_height,
            disconnecting = depth,
            connecting = connected,
            "reorganizing chain"
        );

        // --- Phase 1: snapshot + WAL ---------------------------------------
        let mut mp = self.mempool.lock();
        let snapshots = StateSnapshots {
            headers: chain.headers.clone(),
            utxo: chain.utxo.snapshot(),
            nonces: chain.nonces.snapshot(),
            supply: chain.supply,
            finality: chain.finality.as_ref().map(|f| f.to_state()),
            mempool: mp.pool.snapshot(),
        };
        let wal = WalRecord::begin(old_tip_hash, new_tip_hash, fork_height, now);
        chain.storage.write_wal(&wal)?;

        // --- Phase 2 + 3: apply and revalidate -----------------------------
        let result = self.apply_reorg(chain, &mut mp, fork_height, &candidate, now);

        match result {
            Ok(()) => {
                // --- Phase 4: commit ---------------------------------------
                for block in &candidate {
                    chain.orphan_blocks.remove(&block.header.hash());
                }
                chain.storage.truncate_blocks_above(fork_height)?;
                for block in &candidate {
                    chain.storage.write_block(block.header.index, block)?;
                }
                for block in &old_suffix {
                    chain.address_index.unindex_block(block.header.index, block)?;
                }
                for block in &candidate {
                    chain.address_index.index_block(block.header.index, block)?;
                }
                chain.persist_state(&mp.pool)?;
                chain.storage.write_wal(&WalRecord { status: WalStatus::Committed, ..wal })?;
                chain.storage.remove_wal()?;

                self.metrics.reorgs.fetch_add(1, Ordering::Relaxed);
                self.telemetry.incr(TelemetryCounter::ReorgCommitted);
                self.listener.reorg_committed(old_tip_hash, new_tip_hash, fork_height);
                info!(fork_height, %new_tip_hash, "reorg committed");

                Ok(BlockDisposition::Reorged {
                    fork_height,
                    disconnected: depth,
                    connected,
                })
            }
            Err(e) => {
                // --- Phase 5: rollback -------------------------------------
                warn!(error = %e, "reorg failed; rolling back");
                mp.pool.restore(snapshots.mempool);
                if let (Some(finality), Some(state)) =
                    (chain.finality.as_mut(), snapshots.finality)
                {
                    finality.load_state(state);
                }
                chain.supply = snapshots.supply;
                chain.nonces.restore(snapshots.nonces);
                chain.utxo.restore(snapshots.utxo);
                chain.headers = snapshots.headers;

                chain.storage.write_wal(&WalRecord { status: WalStatus::RolledBack, ..wal })?;
                chain.storage.remove_wal()?;
                self.telemetry.incr(TelemetryCounter::ReorgRolledBack);
                Err(e)
            }
        }
    }

    /// Rewind to the fork point and connect the candidate blocks.
    ///
    /// Mutates chain state in place; the caller restores snapshots on error.
    fn apply_reorg(
        &self,
        chain: &mut ChainInner,
        mp: &mut MempoolState,
        fork_height: u64,
        candidate: &[Block],
        now: i64,
    ) -> Result<(), ChainError> {
        // Rewind: rebuild fresh state by replaying the retained prefix. The
        // stored blocks were fully validated when first connected, so this
        // is pure state application.
        let mut utxo = xai_core::utxo::UtxoSet::new();
        let mut nonces = xai_core::nonce::NonceTracker::new();
        let mut supply = 0u64;
        for height in 0..=fork_height {
            let block = chain
                .storage
                .read_block(height)?
                .ok_or_else(|| ChainError::Storage(format!("missing block file {height}")))?;
            apply_block_to_state(&mut utxo, &mut nonces, &mut supply, &block)?;
        }
        chain.utxo = utxo;
        chain.nonces = nonces;
        chain.supply = supply;
        chain.headers.truncate((fork_height + 1) as usize);

        // Connect: full admission rules for every candidate block.
        for block in candidate {
            let context =
                engine::context_for_next(&self.config, &chain.headers, chain.supply, now);
            xai_core::block_validation::validate_block(
                block,
                &self.config,
                &context,
                |op| chain.utxo.get(op).cloned(),
                &chain.nonces,
            )
            .map_err(|e| ChainError::Fork(ForkError::InvalidCandidate(e.to_string())))?;
            apply_block_to_state(&mut chain.utxo, &mut chain.nonces, &mut chain.supply, block)?;
            chain.headers.push(block.header.clone());
        }

        // Mempool revalidation against the new tip state.
        self.revalidate_mempool(chain, mp);
        Ok(())
    }

    /// Drop every mempool entry that no longer validates against the
    /// current chain state, respecting per-sender nonce sequencing.
    pub(crate) fn revalidate_mempool(&self, chain: &ChainInner, mp: &mut MempoolState) {
        // Group per sender, nonce-ascending, so surviving chains of pending
        // transactions keep their contiguous sequence.
        let mut entries: Vec<MempoolEntry> = mp.pool.snapshot();
        entries.sort_by(|a, b| (&a.tx.sender, a.tx.nonce).cmp(&(&b.tx.sender, b.tx.nonce)));

        let mut expected: std::collections::HashMap<xai_core::address::Address, u64> =
            std::collections::HashMap::new();

        for entry in entries {
            let expected_nonce = if entry.tx.requires_signature() {
                Some(
                    *expected
                        .entry(entry.tx.sender.clone())
                        .or_insert_with(|| chain.nonces.peek(&entry.tx.sender)),
                )
            } else {
                None
            };
            let valid = validation::validate_transaction(
                &entry.tx,
                &self.config,
                |op| chain.utxo.get(op).cloned(),
                chain.tip_height(),
                expected_nonce,
            )
            .is_ok();
            if valid {
                if let Some(n) = expected.get_mut(&entry.tx.sender) {
                    *n += 1;
                }
            } else {
                debug!(txid = %entry.txid, "evicting mempool entry invalidated by reorg");
                mp.pool.remove(&entry.txid);
            }
        }
    }
}
