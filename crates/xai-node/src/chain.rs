//! The blockchain facade.
//!
//! [`Blockchain`] exclusively owns the chain prefix (headers in memory, full
//! blocks on disk), the UTXO set, nonce tracker, mempool, orphan pools,
//! finality and checkpoint state. All mutation happens through its methods
//! under two locks with a fixed ordering: the chain lock first, the mempool
//! lock second. Block admission is linearizable on the chain lock; for a
//! given `(prev_tip, block)` pair the outcome is deterministic and
//! independent of thread scheduling.
//!
//! Incoming blocks dispatch three ways (extend / orphan / fork); fork
//! handling lives in [`reorg`](crate::reorg).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn};

use xai_consensus::checkpoint::{Checkpoint, CheckpointManager};
use xai_consensus::engine;
use xai_consensus::finality::{FinalityManager, Validator, VoteOutcome};
use xai_core::address::Address;
use xai_core::config::Config;
use xai_core::crypto::{self, KeyPair};
use xai_core::error::{
    ChainError, ConfigError, FinalityError, MempoolError, RejectReason, TransactionError,
};
use xai_core::genesis::{self, GenesisProvider};
use xai_core::mempool::{BanTracker, Mempool};
use xai_core::nonce::NonceTracker;
use xai_core::traits::{
    EventListener, NullListener, NullSlashing, NullTelemetry, SlashingSink, TelemetryCounter,
    TelemetrySink,
};
use xai_core::types::{
    Block, BlockHeader, Hash256, OutPoint, Transaction, TxOutput, TxType, UtxoEntry,
};
use xai_core::utxo::UtxoSet;
use xai_core::{block_validation, constants, validation};

use crate::address_index::{AddressIndex, AddressIndexEntry};
use crate::config::NodeConfig;
use crate::storage::{ChainStorage, PersistedMempoolTx, PersistedState};

/// Outcome of [`Blockchain::add_block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockDisposition {
    /// Appended to the current tip.
    Extended,
    /// Triggered a chain reorganization.
    Reorged {
        fork_height: u64,
        disconnected: u64,
        connected: u64,
    },
    /// Parent unknown; stashed for later reconnection.
    Orphaned,
    /// Identical block already in the canonical chain.
    AlreadyHave,
}

/// Reference to a block by height or hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Height(u64),
    Hash(Hash256),
}

/// Mempool rejection/eviction counters surfaced in [`NodeStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MempoolMetrics {
    pub rejected_invalid: u64,
    pub rejected_banned: u64,
    pub rejected_low_fee: u64,
    pub rejected_sender_cap: u64,
    pub evicted_low_fee: u64,
    pub expired: u64,
    pub active_bans: usize,
}

/// Live node health snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStats {
    pub height: u64,
    pub tip_hash: Hash256,
    pub difficulty: u32,
    pub supply: u64,
    pub mempool_size: usize,
    pub mempool_bytes: usize,
    pub orphan_blocks: usize,
    pub orphan_txs: usize,
    pub finalized_height: Option<u64>,
    pub mempool_metrics: MempoolMetrics,
    pub timestamp: i64,
}

/// Consistent point-in-time view of chain state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    pub height: u64,
    pub tip: Hash256,
    pub utxo_digest: Hash256,
    pub pending_count: usize,
    pub timestamp: i64,
}

/// Approximate runtime counters (never consensus-relevant).
#[derive(Default)]
pub(crate) struct Metrics {
    pub rejected_invalid: AtomicU64,
    pub rejected_banned: AtomicU64,
    pub rejected_low_fee: AtomicU64,
    pub rejected_sender_cap: AtomicU64,
    pub evicted_low_fee: AtomicU64,
    pub expired: AtomicU64,
    pub blocks_connected: AtomicU64,
    pub reorgs: AtomicU64,
}

/// Everything guarded by the chain lock.
pub(crate) struct ChainInner {
    /// Full header chain, `headers[h].index == h`.
    pub headers: Vec<BlockHeader>,
    pub utxo: UtxoSet,
    pub nonces: NonceTracker,
    pub finality: Option<FinalityManager>,
    pub checkpoints: CheckpointManager,
    /// Orphan blocks keyed by height, oldest first within a height.
    pub orphan_blocks: HashMap<Hash256, (Block, i64)>,
    /// Total coinbase (and faucet) issuance on the canonical chain.
    pub supply: u64,
    pub storage: ChainStorage,
    pub address_index: AddressIndex,
}

impl ChainInner {
    pub fn tip(&self) -> &BlockHeader {
        self.headers.last().expect("chain always contains genesis")
    }

    pub fn tip_height(&self) -> u64 {
        self.tip().index
    }

    pub fn find_orphan_by_hash(&self, hash: &Hash256) -> Option<&Block> {
        self.orphan_blocks.get(hash).map(|(b, _)| b)
    }

    /// Persist the mutable state snapshot (`state.bin`).
    pub fn persist_state(&self, mempool: &Mempool) -> Result<(), ChainError> {
        let state = PersistedState {
            utxos: self.utxo.iter().map(|(op, e)| (op.clone(), e.clone())).collect(),
            nonces: self.nonces.iter().map(|(a, n)| (a.clone(), n)).collect(),
            mempool: mempool
                .iter()
                .map(|e| PersistedMempoolTx {
                    tx: e.tx.clone(),
                    fee: e.fee,
                    size: e.size,
                    admitted_at: e.admitted_at,
                })
                .collect(),
            supply: self.supply,
        };
        self.storage.write_state(&state)
    }
}

/// Everything guarded by the mempool lock.
pub(crate) struct MempoolState {
    pub pool: Mempool,
    pub bans: BanTracker,
    /// Transactions whose inputs are not yet confirmed, retried after each
    /// connected block.
    pub orphan_txs: HashMap<Hash256, (Transaction, i64)>,
}

/// Construction options for sinks, validator set, and clock.
pub struct BlockchainOptions {
    pub listener: Arc<dyn EventListener>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub slashing: Arc<dyn SlashingSink>,
    /// Overrides `validators.json` when set.
    pub validators: Option<Vec<Validator>>,
    pub clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Default for BlockchainOptions {
    fn default() -> Self {
        Self {
            listener: Arc::new(NullListener),
            telemetry: Arc::new(NullTelemetry),
            slashing: Arc::new(NullSlashing),
            validators: None,
            clock: Box::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64
            }),
        }
    }
}

/// The replicated state machine.
pub struct Blockchain {
    pub(crate) config: Config,
    pub(crate) chain: Mutex<ChainInner>,
    pub(crate) mempool: Mutex<MempoolState>,
    pub(crate) listener: Arc<dyn EventListener>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) slashing: Arc<dyn SlashingSink>,
    pub(crate) metrics: Metrics,
    pub(crate) clock: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Blockchain {
    /// Open a node with default (no-op) sinks and the system clock.
    pub fn open(
        node_config: &NodeConfig,
        genesis_provider: &GenesisProvider,
    ) -> Result<Self, ChainError> {
        Self::open_with(node_config, genesis_provider, BlockchainOptions::default())
    }

    /// Open a node: validates configuration, performs crash recovery if a
    /// write-ahead log is present, loads or creates the genesis block, and
    /// rebuilds in-memory state from the newest matching checkpoint plus
    /// replay.
    pub fn open_with(
        node_config: &NodeConfig,
        genesis_provider: &GenesisProvider,
        options: BlockchainOptions,
    ) -> Result<Self, ChainError> {
        let config = node_config.chain.clone();
        config.validate()?;

        let storage = ChainStorage::open(node_config)?;

        // Crash recovery: an in-progress WAL means a reorg died mid-flight.
        // Discard whatever state files claim and rebuild from blocks +
        // checkpoints below; the torn suffix is trimmed by load_blocks.
        let recovering = match storage.read_wal()? {
            Some(wal) if wal.status == crate::storage::WalStatus::InProgress => {
                warn!(fork_point = wal.fork_point, "incomplete reorg detected; recovering");
                true
            }
            Some(_) => false,
            None => false,
        };

        let genesis_block = genesis::resolve_genesis(genesis_provider, &config)?;

        let mut blocks = storage.load_blocks()?;
        if blocks.is_empty() {
            // Genesis is defined rather than mined, so the proof-of-work
            // rule does not apply; everything else must hold.
            verify_genesis_shape(&genesis_block, &config)?;
            storage.write_block(0, &genesis_block)?;
            blocks.push(genesis_block.clone());
        } else if blocks[0].header.hash() != genesis_block.header.hash() {
            return Err(ConfigError::GenesisHashMismatch {
                expected: genesis_block.header.hash().to_string(),
                got: blocks[0].header.hash().to_string(),
            }
            .into());
        }

        // Checkpoint acceleration: restore from the newest checkpoint whose
        // hash matches the on-disk block at that height, then replay forward.
        let checkpoint_files = storage.load_checkpoints()?;
        let checkpoints = CheckpointManager::from_records(
            &config,
            checkpoint_files.iter().map(|f| f.record.clone()).collect(),
        );

        let mut utxo = UtxoSet::new();
        let mut nonces = NonceTracker::new();
        let mut supply = 0u64;
        let mut replay_from = 0usize;

        for file in checkpoint_files.iter().rev() {
            let height = file.record.height as usize;
            if height < blocks.len()
                && blocks[height].header.hash() == file.record.block_hash
            {
                let mut restored = UtxoSet::new();
                for (op, entry) in &file.utxos {
                    restored.restore_entries(vec![(op.clone(), entry.clone())]);
                }
                if restored.digest() != file.record.utxo_digest {
                    warn!(height, "checkpoint digest mismatch; ignoring it");
                    continue;
                }
                utxo = restored;
                nonces = NonceTracker::from_entries(
                    file.nonces.iter().map(|(a, n)| (a.clone(), *n)),
                );
                supply = file.record.supply;
                replay_from = height + 1;
                debug!(height, "restored state from checkpoint");
                break;
            }
        }

        for block in &blocks[replay_from..] {
            apply_block_to_state(&mut utxo, &mut nonces, &mut supply, block)?;
        }

        let address_index = AddressIndex::open(node_config.address_index_path())?;
        if recovering {
            address_index.rebuild(blocks.iter())?;
        }

        // Finality: explicit validator set wins over validators.json.
        let validators = match options.validators {
            Some(v) => Some(v),
            None => storage.read_validators()?,
        };
        let finality = match validators {
            Some(v) => {
                let mut manager = FinalityManager::new(v, config.finality_quorum_percent)?;
                if let Some(state) = storage.read_finality_state()? {
                    manager.load_state(state);
                }
                Some(manager)
            }
            None => None,
        };

        // Mempool: reload the persisted snapshot; stale entries are dropped
        // on the next revalidation pass.
        let mut pool = Mempool::new(&config);
        if !recovering {
            if let Some(state) = storage.read_state()? {
                for entry in state.mempool {
                    let _ = pool.insert(entry.tx, entry.fee, entry.size, entry.admitted_at);
                }
            }
        }

        if recovering {
            storage.remove_wal()?;
            info!("crash recovery complete");
        } else {
            // A committed/rolled-back WAL left behind is just stale.
            storage.remove_wal()?;
        }

        let headers: Vec<BlockHeader> = blocks.iter().map(|b| b.header.clone()).collect();
        let inner = ChainInner {
            headers,
            utxo,
            nonces,
            finality,
            checkpoints,
            orphan_blocks: HashMap::new(),
            supply,
            storage,
            address_index,
        };

        info!(
            height = inner.tip_height(),
            supply = inner.supply,
            "chain opened"
        );

        Ok(Self {
            config: config.clone(),
            chain: Mutex::new(inner),
            mempool: Mutex::new(MempoolState {
                pool,
                bans: BanTracker::new(&config),
                orphan_txs: HashMap::new(),
            }),
            listener: options.listener,
            telemetry: options.telemetry,
            slashing: options.slashing,
            metrics: Metrics::default(),
            clock: options.clock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    // ------------------------------------------------------------------
    // Transaction submission
    // ------------------------------------------------------------------

    /// Validate and admit a transaction to the mempool.
    ///
    /// Returns the txid on admission. Rejections carry an [`ErrorKind`]
    /// (via [`RejectReason::from`]); transactions spending not-yet-confirmed
    /// outputs are additionally held in the orphan pool and retried after
    /// each connected block.
    ///
    /// [`ErrorKind`]: xai_core::error::ErrorKind
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, ChainError> {
        let now = self.now();
        let mut chain = self.chain.lock();
        let mut mp = self.mempool.lock();
        let result = self.admit_transaction(&chain, &mut mp, tx.clone(), now);
        // Release any reservation `create_transaction` took; the mempool's
        // conflict index protects admitted inputs from here on.
        chain.utxo.unlock(&tx.inputs);
        match &result {
            Ok(_) => chain.persist_state(&mp.pool)?,
            Err(err) => {
                self.listener.mempool_rejected(&tx.txid(), &RejectReason::from(err));
            }
        }
        result
    }

    fn admit_transaction(
        &self,
        chain: &ChainInner,
        mp: &mut MempoolState,
        tx: Transaction,
        now: i64,
    ) -> Result<Hash256, ChainError> {
        if let Some(until) = mp.bans.banned_until(&tx.sender, now) {
            self.metrics.rejected_banned.fetch_add(1, Ordering::Relaxed);
            self.telemetry.incr(TelemetryCounter::TxRejectedBanned);
            return Err(MempoolError::SenderBanned { sender: tx.sender.to_string(), until }.into());
        }

        // Mempool admission allows the next contiguous nonce: the chain's
        // expectation advanced by the sender's pending transactions. An RBF
        // replacement instead takes over the nonce slot of the entry it
        // displaces.
        let expected_nonce = if tx.requires_signature() {
            let replaced_slot = tx
                .replaces_txid
                .and_then(|old| mp.pool.get(&old))
                .filter(|e| e.tx.sender == tx.sender)
                .map(|e| e.tx.nonce);
            Some(replaced_slot.unwrap_or_else(|| {
                chain.nonces.peek(&tx.sender) + mp.pool.sender_count(&tx.sender) as u64
            }))
        } else {
            None
        };

        let validated = match validation::validate_transaction(
            &tx,
            &self.config,
            |op| chain.utxo.get(op).cloned(),
            chain.tip_height(),
            expected_nonce,
        ) {
            Ok(v) => v,
            Err(TransactionError::UnknownUtxo(detail)) => {
                // Possibly a chained spend of a pending parent: hold it and
                // retry once the parent confirms. Not a ban offense.
                self.stash_orphan_tx(mp, tx, now);
                self.metrics.rejected_invalid.fetch_add(1, Ordering::Relaxed);
                self.telemetry.incr(TelemetryCounter::TxRejectedInvalid);
                return Err(TransactionError::UnknownUtxo(detail).into());
            }
            Err(e) => {
                self.metrics.rejected_invalid.fetch_add(1, Ordering::Relaxed);
                self.telemetry.incr(TelemetryCounter::TxRejectedInvalid);
                if let Some(until) = mp.bans.record_failure(&tx.sender, now) {
                    warn!(sender = %tx.sender, until, "sender banned for repeated invalid txs");
                    self.telemetry.incr(TelemetryCounter::SenderBanned);
                }
                return Err(e.into());
            }
        };

        match mp.pool.insert(tx.clone(), validated.fee, validated.size, now) {
            Ok(txid) => {
                mp.bans.clear(&tx.sender);
                self.telemetry.incr(TelemetryCounter::TxAdmitted);
                debug!(%txid, fee = validated.fee, "transaction admitted");
                Ok(txid)
            }
            Err(e) => {
                match &e {
                    MempoolError::FeeRateTooLow { .. } => {
                        self.metrics.rejected_low_fee.fetch_add(1, Ordering::Relaxed);
                        self.telemetry.incr(TelemetryCounter::TxRejectedLowFee);
                    }
                    MempoolError::SenderCapExceeded { .. } => {
                        self.metrics.rejected_sender_cap.fetch_add(1, Ordering::Relaxed);
                        self.telemetry.incr(TelemetryCounter::TxRejectedSenderCap);
                    }
                    _ => {
                        self.metrics.rejected_invalid.fetch_add(1, Ordering::Relaxed);
                        self.telemetry.incr(TelemetryCounter::TxRejectedInvalid);
                    }
                }
                Err(e.into())
            }
        }
    }

    fn stash_orphan_tx(&self, mp: &mut MempoolState, tx: Transaction, now: i64) {
        if mp.orphan_txs.len() >= constants::MAX_ORPHAN_TXS {
            // Evict the oldest entry.
            if let Some(oldest) = mp
                .orphan_txs
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(txid, _)| *txid)
            {
                mp.orphan_txs.remove(&oldest);
            }
        }
        mp.orphan_txs.insert(tx.txid(), (tx, now));
    }

    /// Build, sign, and return a transfer from `keypair`'s address.
    ///
    /// Selects confirmed spendable outputs (smallest-first), reserves them
    /// against concurrent builders, pays `amount` to `recipient`, and
    /// returns change to the sender. The reservation is released when the
    /// transaction is submitted.
    pub fn create_transaction(
        &self,
        keypair: &KeyPair,
        recipient: Address,
        amount: u64,
        fee: u64,
        rbf_enabled: bool,
    ) -> Result<Transaction, ChainError> {
        let prefix = self.config.network.address_prefix();
        let sender = keypair.address(prefix);
        let need = amount
            .checked_add(fee)
            .ok_or(TransactionError::ValueOverflow)?;

        let mut chain = self.chain.lock();
        let next_height = chain.tip_height() + 1;

        let mut selected: Vec<(OutPoint, UtxoEntry)> = Vec::new();
        let mut total = 0u64;
        let mut spendable = chain.utxo.find_spendable(&sender);
        spendable.sort_by_key(|(_, e)| e.amount);
        for (op, entry) in spendable {
            if !entry.is_mature(next_height, self.config.coinbase_maturity) {
                continue;
            }
            total = total.saturating_add(entry.amount);
            selected.push((op, entry));
            if total >= need {
                break;
            }
        }
        if total < need {
            return Err(TransactionError::InsufficientInputs { have: total, need }.into());
        }

        let inputs: Vec<OutPoint> = selected.iter().map(|(op, _)| op.clone()).collect();
        chain.utxo.lock(&inputs)?;

        let mut outputs = vec![TxOutput { address: recipient.clone(), amount }];
        let change = total - need;
        if change > 0 {
            outputs.push(TxOutput { address: sender.clone(), amount: change });
        }

        let pending = self.mempool.lock().pool.sender_count(&sender) as u64;
        let mut tx = Transaction {
            sender,
            recipient,
            amount,
            fee,
            public_key: vec![],
            nonce: chain.nonces.peek(&keypair.address(prefix)) + pending,
            tx_type: TxType::Transfer,
            timestamp: self.now(),
            inputs,
            outputs,
            signature: None,
            rbf_enabled,
            replaces_txid: None,
        };
        crypto::sign_transaction(&mut tx, keypair);
        Ok(tx)
    }

    /// Convenience: build and submit in one call.
    pub fn send(
        &self,
        keypair: &KeyPair,
        recipient: Address,
        amount: u64,
        fee: u64,
    ) -> Result<Hash256, ChainError> {
        let tx = self.create_transaction(keypair, recipient, amount, fee, false)?;
        self.submit_transaction(tx)
    }

    // ------------------------------------------------------------------
    // Block admission
    // ------------------------------------------------------------------

    /// Single entry point for new blocks, mined locally or received from
    /// peers. Dispatches to tip extension, orphan stash, or fork handling.
    pub fn add_block(&self, block: Block) -> Result<BlockDisposition, ChainError> {
        let now = self.now();
        let block_hash = block.header.hash();
        let _span = info_span!(
            "add_block",
            height = block.header.index,
            %block_hash,
            txs = block.transactions.len()
        )
        .entered();

        let mut chain = self.chain.lock();
        let tip_height = chain.tip_height();
        let tip_hash = chain.tip().hash();
        let height = block.header.index;

        if height <= tip_height && chain.headers[height as usize].hash() == block_hash {
            return Ok(BlockDisposition::AlreadyHave);
        }

        if height == tip_height + 1 && block.header.previous_hash == tip_hash {
            self.connect_tip(&mut chain, block, now)?;
            self.connect_ready_orphans(&mut chain, now);
            return Ok(BlockDisposition::Extended);
        }

        // A block attaching below the tip (or an orphan chain that just
        // completed) is a fork candidate.
        if let Some((fork_height, candidate)) = crate::reorg::assemble_candidate(&chain, &block) {
            let disposition = self.attempt_reorg(&mut chain, fork_height, candidate, now);
            return match disposition {
                Ok(d) => {
                    self.connect_ready_orphans(&mut chain, now);
                    Ok(d)
                }
                Err(e) => {
                    self.telemetry.incr(TelemetryCounter::BlockRejected);
                    Err(e)
                }
            };
        }

        // Parent unknown: stash and wait for lineage to fill in.
        self.stash_orphan_block(&mut chain, block, now);
        self.telemetry.incr(TelemetryCounter::BlockOrphaned);
        Ok(BlockDisposition::Orphaned)
    }

    /// Validate and append a block at `tip + 1`, then apply it to state.
    pub(crate) fn connect_tip(
        &self,
        chain: &mut ChainInner,
        block: Block,
        now: i64,
    ) -> Result<(), ChainError> {
        let context = engine::context_for_next(&self.config, &chain.headers, chain.supply, now);
        block_validation::validate_block(
            &block,
            &self.config,
            &context,
            |op| chain.utxo.get(op).cloned(),
            &chain.nonces,
        )
        .map_err(|e| {
            self.telemetry.incr(TelemetryCounter::BlockRejected);
            ChainError::from(e)
        })?;

        let height = block.header.index;
        // Disk first: a failed write aborts before any in-memory mutation,
        // and a crash right after leaves a recoverable suffix on disk.
        chain.storage.write_block(height, &block)?;
        apply_block_to_state(&mut chain.utxo, &mut chain.nonces, &mut chain.supply, &block)?;
        chain.headers.push(block.header.clone());
        chain.address_index.index_block(height, &block)?;

        if chain.checkpoints.is_due(height) {
            self.write_checkpoint(chain, height, &block)?;
        }

        // Mempool bookkeeping under the mempool lock (chain lock held).
        let mut mp = self.mempool.lock();
        mp.pool.remove_confirmed_block(&block);
        self.retry_orphan_txs(chain, &mut mp, now);
        chain.persist_state(&mp.pool)?;
        drop(mp);

        self.metrics.blocks_connected.fetch_add(1, Ordering::Relaxed);
        self.telemetry.incr(TelemetryCounter::BlockConnected);
        info!(height, txs = block.transactions.len(), "block connected");
        Ok(())
    }

    fn write_checkpoint(
        &self,
        chain: &mut ChainInner,
        height: u64,
        block: &Block,
    ) -> Result<(), ChainError> {
        let record = Checkpoint {
            height,
            block_hash: block.header.hash(),
            utxo_digest: chain.utxo.digest(),
            supply: chain.supply,
        };
        chain.storage.write_checkpoint(&crate::storage::CheckpointFile {
            record: record.clone(),
            utxos: chain.utxo.iter().map(|(op, e)| (op.clone(), e.clone())).collect(),
            nonces: chain.nonces.iter().map(|(a, n)| (a.clone(), n)).collect(),
        })?;
        for evicted in chain.checkpoints.record(record) {
            chain.storage.delete_checkpoint(evicted)?;
        }
        debug!(height, "checkpoint written");
        Ok(())
    }

    /// Re-run held orphan transactions against the new tip state.
    fn retry_orphan_txs(&self, chain: &ChainInner, mp: &mut MempoolState, now: i64) {
        let cutoff = now - constants::ORPHAN_TX_EXPIRY_SECS;
        mp.orphan_txs.retain(|_, (_, at)| *at >= cutoff);

        let candidates: Vec<Transaction> =
            mp.orphan_txs.values().map(|(tx, _)| tx.clone()).collect();
        for tx in candidates {
            let txid = tx.txid();
            let expected_nonce = if tx.requires_signature() {
                Some(chain.nonces.peek(&tx.sender) + mp.pool.sender_count(&tx.sender) as u64)
            } else {
                None
            };
            match validation::validate_transaction(
                &tx,
                &self.config,
                |op| chain.utxo.get(op).cloned(),
                chain.tip_height(),
                expected_nonce,
            ) {
                Ok(validated) => {
                    mp.orphan_txs.remove(&txid);
                    if mp.pool.insert(tx, validated.fee, validated.size, now).is_ok() {
                        self.telemetry.incr(TelemetryCounter::TxAdmitted);
                        debug!(%txid, "orphan transaction admitted");
                    }
                }
                Err(TransactionError::UnknownUtxo(_)) => {} // still waiting
                Err(_) => {
                    // Permanently invalid against the chain that confirmed.
                    mp.orphan_txs.remove(&txid);
                }
            }
        }
    }

    fn stash_orphan_block(&self, chain: &mut ChainInner, block: Block, now: i64) {
        if chain.orphan_blocks.len() >= self.config.max_orphan_blocks {
            // Evict the lowest-height, oldest entry.
            if let Some(victim) = chain
                .orphan_blocks
                .iter()
                .min_by_key(|(_, (b, at))| (b.header.index, *at))
                .map(|(hash, _)| *hash)
            {
                chain.orphan_blocks.remove(&victim);
            }
        }
        debug!(
            height = block.header.index,
            parent = %block.header.previous_hash,
            "block stashed as orphan"
        );
        chain.orphan_blocks.insert(block.header.hash(), (block, now));
    }

    /// Connect any stashed orphans that now attach to the tip, repeatedly.
    fn connect_ready_orphans(&self, chain: &mut ChainInner, now: i64) {
        loop {
            let tip_hash = chain.tip().hash();
            let next_height = chain.tip_height() + 1;
            let ready = chain
                .orphan_blocks
                .values()
                .find(|(b, _)| b.header.previous_hash == tip_hash && b.header.index == next_height)
                .map(|(b, _)| b.clone());
            let Some(block) = ready else { break };
            let hash = block.header.hash();
            chain.orphan_blocks.remove(&hash);
            if let Err(e) = self.connect_tip(chain, block, now) {
                debug!(%hash, error = %e, "stashed orphan failed validation; dropped");
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Finality
    // ------------------------------------------------------------------

    /// Record a validator's finality vote for a block.
    ///
    /// Emits `block_finalized` and persists finality state when the vote
    /// completes a certificate.
    pub fn submit_finality_vote(
        &self,
        validator: &Address,
        block: BlockId,
        signature: &[u8],
    ) -> Result<VoteOutcome, ChainError> {
        let mut chain = self.chain.lock();
        let header = self
            .resolve_header(&chain, block)
            .ok_or_else(|| FinalityError::UnknownBlock(format!("{block:?}")))?;

        let inner = &mut *chain;
        let finality = inner.finality.as_mut().ok_or_else(|| {
            FinalityError::InvalidValidatorSet("finality is not enabled on this node".into())
        })?;
        let outcome = finality.record_vote(validator, &header, signature, self.slashing.as_ref())?;

        if outcome.finalized {
            let state = finality.to_state();
            inner.storage.write_finality_state(&state)?;
            self.listener.block_finalized(header.index, &header.hash());
        }
        Ok(outcome)
    }

    pub fn is_finalized(&self, block: BlockId) -> bool {
        let chain = self.chain.lock();
        match (&chain.finality, block) {
            (Some(f), BlockId::Height(h)) => f.is_finalized_height(h),
            (Some(f), BlockId::Hash(hash)) => f.is_finalized_hash(&hash),
            (None, _) => false,
        }
    }

    pub fn highest_finalized_height(&self) -> Option<u64> {
        self.chain.lock().finality.as_ref().and_then(|f| f.highest_finalized_height())
    }

    fn resolve_header(&self, chain: &ChainInner, block: BlockId) -> Option<BlockHeader> {
        match block {
            BlockId::Height(h) => chain.headers.get(h as usize).cloned(),
            BlockId::Hash(hash) => chain.headers.iter().find(|h| h.hash() == hash).cloned(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn height(&self) -> u64 {
        self.chain.lock().tip_height()
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.chain.lock().tip().hash()
    }

    pub fn get_block(&self, height: u64) -> Result<Option<Block>, ChainError> {
        self.chain.lock().storage.read_block(height)
    }

    pub fn get_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let chain = self.chain.lock();
        let height = chain.headers.iter().position(|h| h.hash() == *hash);
        match height {
            Some(h) => chain.storage.read_block(h as u64),
            None => Ok(None),
        }
    }

    pub fn get_header(&self, height: u64) -> Option<BlockHeader> {
        self.chain.lock().headers.get(height as usize).cloned()
    }

    pub fn get_balance(&self, address: &Address) -> u64 {
        self.chain.lock().utxo.get_balance(address)
    }

    /// Paginated transaction history from the address index.
    pub fn get_transaction_history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AddressIndexEntry>, ChainError> {
        self.chain.lock().address_index.history(address, limit, offset)
    }

    pub fn get_stats(&self) -> NodeStats {
        let now = self.now();
        let chain = self.chain.lock();
        let mp = self.mempool.lock();
        NodeStats {
            height: chain.tip_height(),
            tip_hash: chain.tip().hash(),
            difficulty: chain.tip().difficulty,
            supply: chain.supply,
            mempool_size: mp.pool.len(),
            mempool_bytes: mp.pool.total_bytes(),
            orphan_blocks: chain.orphan_blocks.len(),
            orphan_txs: mp.orphan_txs.len(),
            finalized_height: chain.finality.as_ref().and_then(|f| f.highest_finalized_height()),
            mempool_metrics: MempoolMetrics {
                rejected_invalid: self.metrics.rejected_invalid.load(Ordering::Relaxed),
                rejected_banned: self.metrics.rejected_banned.load(Ordering::Relaxed),
                rejected_low_fee: self.metrics.rejected_low_fee.load(Ordering::Relaxed),
                rejected_sender_cap: self.metrics.rejected_sender_cap.load(Ordering::Relaxed),
                evicted_low_fee: self.metrics.evicted_low_fee.load(Ordering::Relaxed),
                expired: self.metrics.expired.load(Ordering::Relaxed),
                active_bans: mp.bans.active_bans(now),
            },
            timestamp: now,
        }
    }

    pub fn get_state_snapshot(&self) -> StateSnapshot {
        let now = self.now();
        let chain = self.chain.lock();
        let mp = self.mempool.lock();
        StateSnapshot {
            height: chain.tip_height(),
            tip: chain.tip().hash(),
            utxo_digest: chain.utxo.digest(),
            pending_count: mp.pool.len(),
            timestamp: now,
        }
    }

    /// Select mempool transactions and assemble an unmined block template.
    pub fn build_block_template(&self, payout: &Address) -> Result<Block, ChainError> {
        let now = self.now();
        let chain = self.chain.lock();
        let mp = self.mempool.lock();
        let selected: Vec<(Transaction, u64)> = mp
            .pool
            .select_for_block(
                self.config.max_block_size_bytes,
                self.config.max_transactions_per_block.saturating_sub(1),
            )
            .into_iter()
            .map(|e| (e.tx.clone(), e.fee))
            .collect();
        drop(mp);
        engine::create_block_template(
            &self.config,
            &chain.headers,
            chain.supply,
            payout,
            &selected,
            now,
        )
        .map_err(ChainError::from)
    }

    /// Periodic maintenance: expire aged mempool entries.
    pub fn expire_mempool(&self) -> usize {
        let now = self.now();
        let _chain = self.chain.lock();
        let mut mp = self.mempool.lock();
        let expired = mp.pool.expire(now);
        for _ in &expired {
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            self.telemetry.incr(TelemetryCounter::TxExpired);
        }
        expired.len()
    }

    /// Periodic maintenance: drop mempool entries below a fee-rate floor
    /// (used when raising the floor under load).
    pub fn evict_mempool_below(&self, rate: u64) -> usize {
        let _chain = self.chain.lock();
        let mut mp = self.mempool.lock();
        let evicted = mp.pool.evict_below(rate);
        for _ in &evicted {
            self.metrics.evicted_low_fee.fetch_add(1, Ordering::Relaxed);
            self.telemetry.incr(TelemetryCounter::TxEvictedLowFee);
        }
        evicted.len()
    }
}

/// Structural sanity for a genesis block: correct height and linkage, a
/// single coinbase, a matching merkle commitment, and an allowed version.
/// Proof-of-work is exempt — genesis is constructed, not mined.
fn verify_genesis_shape(block: &Block, config: &Config) -> Result<(), ChainError> {
    use xai_core::error::BlockError;
    use xai_core::merkle;

    if block.header.index != 0 || !block.header.previous_hash.is_zero() {
        return Err(BlockError::InvalidPrevHash.into());
    }
    if !config.allowed_header_versions.contains(&block.header.version) {
        return Err(BlockError::InvalidVersion(block.header.version).into());
    }
    match block.transactions.as_slice() {
        [coinbase] if coinbase.is_coinbase() => {}
        [] => return Err(BlockError::NoCoinbase.into()),
        _ => return Err(BlockError::FirstTxNotCoinbase.into()),
    }
    let txids: Vec<Hash256> = block.transactions.iter().map(|t| t.txid()).collect();
    if block.header.merkle_root != merkle::merkle_root(&txids) {
        return Err(BlockError::InvalidMerkleRoot.into());
    }
    Ok(())
}

/// Apply a validated block's effects to UTXO, nonce, and supply state.
pub(crate) fn apply_block_to_state(
    utxo: &mut UtxoSet,
    nonces: &mut NonceTracker,
    supply: &mut u64,
    block: &Block,
) -> Result<(), ChainError> {
    let height = block.header.index;
    for tx in &block.transactions {
        if !tx.inputs.is_empty() {
            utxo.apply_inputs(tx)?;
        }
        utxo.apply_outputs(tx, height);
        if tx.requires_signature() {
            nonces.apply(&tx.sender, tx.nonce)?;
        }
        if tx.is_coinbase() || tx.is_faucet() {
            let minted = tx.total_output_value().ok_or(ChainError::Transaction(
                TransactionError::ValueOverflow,
            ))?;
            *supply = supply.saturating_add(minted);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xai_core::constants::COIN;
    use xai_core::genesis::{GenesisSpec, GENESIS_TIMESTAMP};

    fn cfg() -> Config {
        Config {
            initial_difficulty: 0,
            coinbase_maturity: 0,
            ..Config::testnet()
        }
    }

    fn test_addr(seed: u8) -> Address {
        Address::from_payload_bytes("TXAI", &[seed; 20])
    }

    fn premined_spec(outputs: Vec<TxOutput>) -> GenesisSpec {
        GenesisSpec {
            premine: outputs,
            timestamp: GENESIS_TIMESTAMP,
            difficulty: 0,
        }
    }

    fn open_funded(dir: &TempDir, kp: &KeyPair, amount: u64) -> Blockchain {
        let node_config = NodeConfig::at(dir.path(), cfg());
        let spec = premined_spec(vec![TxOutput {
            address: kp.address("TXAI"),
            amount,
        }]);
        Blockchain::open(&node_config, &GenesisProvider::Spec(spec)).unwrap()
    }

    #[test]
    fn open_creates_genesis() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.get_balance(&kp.address("TXAI")), 100 * COIN);
        assert_eq!(chain.get_stats().supply, 100 * COIN);
        assert!(chain.get_block(0).unwrap().is_some());
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let tip = {
            let chain = open_funded(&dir, &kp, 100 * COIN);
            chain.tip_hash()
        };
        let chain = open_funded(&dir, &kp, 100 * COIN);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.tip_hash(), tip);
    }

    #[test]
    fn genesis_pin_mismatch_fails_startup() {
        let dir = TempDir::new().unwrap();
        let node_config = NodeConfig::at(
            dir.path(),
            Config {
                expected_genesis_hash: Some(Hash256([0xAB; 32])),
                ..cfg()
            },
        );
        let spec = premined_spec(vec![TxOutput { address: test_addr(1), amount: COIN }]);
        let err = Blockchain::open(&node_config, &GenesisProvider::Spec(spec)).unwrap_err();
        assert!(matches!(
            err,
            ChainError::Config(ConfigError::GenesisHashMismatch { .. })
        ));
    }

    #[test]
    fn invalid_config_fails_startup() {
        let dir = TempDir::new().unwrap();
        let node_config = NodeConfig::at(
            dir.path(),
            Config {
                allowed_header_versions: vec![],
                ..cfg()
            },
        );
        let spec = premined_spec(vec![TxOutput { address: test_addr(1), amount: COIN }]);
        assert!(Blockchain::open(&node_config, &GenesisProvider::Spec(spec)).is_err());
    }

    #[test]
    fn create_transaction_builds_change() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        let tx = chain
            .create_transaction(&kp, test_addr(0xBB), 40 * COIN, COIN, false)
            .unwrap();
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].amount, 40 * COIN);
        assert_eq!(tx.outputs[1].amount, 59 * COIN);
        assert_eq!(tx.outputs[1].address, kp.address("TXAI"));
        assert_eq!(tx.nonce, 0);
        assert!(tx.signature.is_some());
    }

    #[test]
    fn create_transaction_insufficient_funds() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 10 * COIN);
        let err = chain
            .create_transaction(&kp, test_addr(0xBB), 40 * COIN, COIN, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::InsufficientInputs { .. })
        ));
    }

    #[test]
    fn create_transaction_reserves_inputs() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        let _pending = chain
            .create_transaction(&kp, test_addr(0xBB), 40 * COIN, COIN, false)
            .unwrap();
        // The single funding UTXO is reserved until the first transaction
        // is submitted; a concurrent builder sees nothing spendable.
        let err = chain
            .create_transaction(&kp, test_addr(0xCC), COIN, COIN, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::Transaction(TransactionError::InsufficientInputs { .. })
        ));
    }

    #[test]
    fn submit_rejects_garbage_and_counts_it() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        let mut tx = chain
            .create_transaction(&kp, test_addr(0xBB), 40 * COIN, COIN, false)
            .unwrap();
        tx.amount += 1; // breaks the signature
        assert!(chain.submit_transaction(tx).is_err());
        assert_eq!(chain.get_stats().mempool_metrics.rejected_invalid, 1);
        assert_eq!(chain.get_stats().mempool_size, 0);
    }

    #[test]
    fn template_block_extends_tip() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        let block = chain.build_block_template(&test_addr(0xAA)).unwrap();
        // Difficulty 0: the unmined template already satisfies PoW.
        assert_eq!(chain.add_block(block).unwrap(), BlockDisposition::Extended);
        assert_eq!(chain.height(), 1);
        assert_eq!(
            chain.get_balance(&test_addr(0xAA)),
            chain.config().initial_block_reward
        );
    }

    #[test]
    fn far_ahead_block_is_orphaned() {
        let dir = TempDir::new().unwrap();
        let kp = KeyPair::generate();
        let chain = open_funded(&dir, &kp, 100 * COIN);
        let mut block = chain.build_block_template(&test_addr(0xAA)).unwrap();
        block.header.index = 10;
        block.header.previous_hash = Hash256([7; 32]);
        assert_eq!(chain.add_block(block).unwrap(), BlockDisposition::Orphaned);
        assert_eq!(chain.get_stats().orphan_blocks, 1);
        assert_eq!(chain.height(), 0);
    }
}
