//! On-disk persistence for the chain.
//!
//! Layout under the node data directory:
//!
//! - `blocks/NNNNNNNN.bin` — one canonical-encoded block per height
//! - `state.bin` — UTXO set, nonce tracker, mempool snapshot, supply total
//! - `checkpoints/CP_<height>.bin` — checkpoint records with state snapshots
//! - `reorg_wal.json` — at most one present; presence means crash recovery
//! - `finality/state.json` — certificates and pending votes
//! - `validators.json` — external validator set configuration
//!
//! Durability-critical writes (WAL, checkpoints, blocks) go through a
//! write-temp-then-rename sequence with an fsync before the rename, so a
//! crash leaves either the old file or the new one, never a torn write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use xai_consensus::checkpoint::Checkpoint;
use xai_consensus::finality::{FinalityState, Validator};
use xai_core::address::Address;
use xai_core::error::ChainError;
use xai_core::types::{Block, Hash256, OutPoint, Transaction, UtxoEntry};

use crate::config::NodeConfig;

/// Serialized mempool entry inside `state.bin`.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PersistedMempoolTx {
    pub tx: Transaction,
    pub fee: u64,
    pub size: usize,
    pub admitted_at: i64,
}

/// Snapshot of mutable chain state persisted after every connected block.
#[derive(Clone, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct PersistedState {
    pub utxos: Vec<(OutPoint, UtxoEntry)>,
    pub nonces: Vec<(Address, u64)>,
    pub mempool: Vec<PersistedMempoolTx>,
    pub supply: u64,
}

/// Checkpoint record plus the state snapshot needed to restore from it.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CheckpointFile {
    pub record: Checkpoint,
    pub utxos: Vec<(OutPoint, UtxoEntry)>,
    pub nonces: Vec<(Address, u64)>,
}

/// Write-ahead-log lifecycle states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalStatus {
    InProgress,
    Committed,
    RolledBack,
}

/// The reorg write-ahead log record (`reorg_wal.json`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WalRecord {
    /// Record type tag; always `REORG_BEGIN`.
    pub record: String,
    pub status: WalStatus,
    pub old_tip: String,
    pub new_tip: String,
    pub fork_point: u64,
    pub timestamp: i64,
}

impl WalRecord {
    pub fn begin(old_tip: Hash256, new_tip: Hash256, fork_point: u64, timestamp: i64) -> Self {
        Self {
            record: "REORG_BEGIN".to_string(),
            status: WalStatus::InProgress,
            old_tip: old_tip.to_string(),
            new_tip: new_tip.to_string(),
            fork_point,
            timestamp,
        }
    }
}

/// File-backed chain storage.
pub struct ChainStorage {
    blocks_dir: PathBuf,
    state_path: PathBuf,
    checkpoints_dir: PathBuf,
    wal_path: PathBuf,
    finality_path: PathBuf,
    validators_path: PathBuf,
}

fn storage_err(e: impl std::fmt::Display) -> ChainError {
    ChainError::Storage(e.to_string())
}

/// Write `data` to `path` durably: temp file, fsync, rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), ChainError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(storage_err)?;
        file.write_all(data).map_err(storage_err)?;
        file.sync_all().map_err(storage_err)?;
    }
    fs::rename(&tmp, path).map_err(storage_err)?;
    Ok(())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, ChainError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, ChainError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(storage_err)
}

impl ChainStorage {
    /// Open (and create) the storage layout under the node's data dir.
    pub fn open(config: &NodeConfig) -> Result<Self, ChainError> {
        let storage = Self {
            blocks_dir: config.blocks_dir(),
            state_path: config.state_path(),
            checkpoints_dir: config.checkpoints_dir(),
            wal_path: config.wal_path(),
            finality_path: config.finality_dir().join("state.json"),
            validators_path: config.validators_path(),
        };
        fs::create_dir_all(&storage.blocks_dir).map_err(storage_err)?;
        fs::create_dir_all(&storage.checkpoints_dir).map_err(storage_err)?;
        fs::create_dir_all(config.finality_dir()).map_err(storage_err)?;
        Ok(storage)
    }

    fn block_path(&self, height: u64) -> PathBuf {
        self.blocks_dir.join(format!("{height:08}.bin"))
    }

    // --- Blocks ---

    pub fn write_block(&self, height: u64, block: &Block) -> Result<(), ChainError> {
        write_atomic(&self.block_path(height), &encode(block)?)
    }

    pub fn read_block(&self, height: u64) -> Result<Option<Block>, ChainError> {
        let path = self.block_path(height);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(storage_err)?;
        Ok(Some(decode(&bytes)?))
    }

    /// Delete block files strictly above `height`.
    pub fn truncate_blocks_above(&self, height: u64) -> Result<(), ChainError> {
        let mut h = height + 1;
        while self.block_path(h).exists() {
            fs::remove_file(self.block_path(h)).map_err(storage_err)?;
            h += 1;
        }
        Ok(())
    }

    /// Load the contiguous block sequence from disk, verifying hash linkage.
    ///
    /// Stops at the first missing, undecodable, or unlinked file and deletes
    /// everything from that point on — a crash mid-reorg may leave a torn
    /// suffix, which replaying from the consistent prefix repairs.
    pub fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let mut blocks: Vec<Block> = Vec::new();
        let mut height = 0u64;
        loop {
            let path = self.block_path(height);
            if !path.exists() {
                break;
            }
            let bytes = fs::read(&path).map_err(storage_err)?;
            let block: Block = match decode(&bytes) {
                Ok(b) => b,
                Err(_) => {
                    warn!(height, "undecodable block file; truncating chain here");
                    self.truncate_blocks_above(height.saturating_sub(1))?;
                    if height == 0 {
                        fs::remove_file(&path).map_err(storage_err)?;
                    }
                    break;
                }
            };
            let linked = block.header.index == height
                && blocks
                    .last()
                    .map(|prev: &Block| block.header.previous_hash == prev.header.hash())
                    .unwrap_or(block.header.previous_hash.is_zero());
            if !linked {
                warn!(height, "unlinked block file; truncating chain here");
                self.truncate_blocks_above(height.saturating_sub(1))?;
                if height == 0 {
                    fs::remove_file(&path).map_err(storage_err)?;
                }
                break;
            }
            blocks.push(block);
            height += 1;
        }
        Ok(blocks)
    }

    // --- Mutable state ---

    pub fn write_state(&self, state: &PersistedState) -> Result<(), ChainError> {
        write_atomic(&self.state_path, &encode(state)?)
    }

    pub fn read_state(&self) -> Result<Option<PersistedState>, ChainError> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.state_path).map_err(storage_err)?;
        Ok(Some(decode(&bytes)?))
    }

    // --- Checkpoints ---

    fn checkpoint_path(&self, height: u64) -> PathBuf {
        self.checkpoints_dir.join(format!("CP_{height}.bin"))
    }

    pub fn write_checkpoint(&self, file: &CheckpointFile) -> Result<(), ChainError> {
        write_atomic(&self.checkpoint_path(file.record.height), &encode(file)?)
    }

    pub fn delete_checkpoint(&self, height: u64) -> Result<(), ChainError> {
        let path = self.checkpoint_path(height);
        if path.exists() {
            fs::remove_file(path).map_err(storage_err)?;
        }
        Ok(())
    }

    pub fn read_checkpoint(&self, height: u64) -> Result<Option<CheckpointFile>, ChainError> {
        let path = self.checkpoint_path(height);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(storage_err)?;
        Ok(Some(decode(&bytes)?))
    }

    /// All persisted checkpoint records, height-ascending. Undecodable files
    /// are skipped with a warning.
    pub fn load_checkpoints(&self) -> Result<Vec<CheckpointFile>, ChainError> {
        let mut found: Vec<CheckpointFile> = Vec::new();
        for entry in fs::read_dir(&self.checkpoints_dir).map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            let bytes = fs::read(entry.path()).map_err(storage_err)?;
            match decode::<CheckpointFile>(&bytes) {
                Ok(file) => found.push(file),
                Err(_) => warn!(path = %entry.path().display(), "skipping bad checkpoint file"),
            }
        }
        found.sort_by_key(|f| f.record.height);
        Ok(found)
    }

    // --- Write-ahead log ---

    pub fn write_wal(&self, record: &WalRecord) -> Result<(), ChainError> {
        let json = serde_json::to_vec_pretty(record).map_err(storage_err)?;
        write_atomic(&self.wal_path, &json)
    }

    pub fn read_wal(&self) -> Result<Option<WalRecord>, ChainError> {
        if !self.wal_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.wal_path).map_err(storage_err)?;
        Ok(Some(serde_json::from_slice(&bytes).map_err(storage_err)?))
    }

    pub fn remove_wal(&self) -> Result<(), ChainError> {
        if self.wal_path.exists() {
            fs::remove_file(&self.wal_path).map_err(storage_err)?;
        }
        Ok(())
    }

    pub fn wal_exists(&self) -> bool {
        self.wal_path.exists()
    }

    // --- Finality ---

    pub fn write_finality_state(&self, state: &FinalityState) -> Result<(), ChainError> {
        let json = serde_json::to_vec(state).map_err(storage_err)?;
        write_atomic(&self.finality_path, &json)
    }

    pub fn read_finality_state(&self) -> Result<Option<FinalityState>, ChainError> {
        if !self.finality_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.finality_path).map_err(storage_err)?;
        Ok(Some(serde_json::from_slice(&bytes).map_err(storage_err)?))
    }

    // --- Validator set ---

    /// Read `validators.json`. A missing file means finality is disabled.
    pub fn read_validators(&self) -> Result<Option<Vec<Validator>>, ChainError> {
        if !self.validators_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.validators_path).map_err(storage_err)?;
        Ok(Some(serde_json::from_slice(&bytes).map_err(storage_err)?))
    }

    pub fn write_validators(&self, validators: &[Validator]) -> Result<(), ChainError> {
        let json = serde_json::to_vec_pretty(validators).map_err(storage_err)?;
        write_atomic(&self.validators_path, &json)
    }
}
