//! Periodic state checkpoints.
//!
//! Every `checkpoint_interval` applied blocks, the node records the block
//! hash, UTXO digest, and supply total at that height. Checkpoints serve
//! two purposes:
//!
//! - **Long-range attack guard**: a reorg whose fork point is at or below
//!   the latest checkpoint height is rejected outright, bounding how much
//!   history an attacker with patience and hash power can rewrite.
//! - **Startup acceleration**: after a crash the node restores the UTXO set
//!   from the newest checkpoint whose hash matches the on-disk block and
//!   replays only the suffix.
//!
//! The manager holds the rolling window in memory; the storage layer
//! persists each record under `checkpoints/CP_<height>.bin`.

use serde::{Deserialize, Serialize};

use xai_core::config::Config;
use xai_core::error::ForkError;
use xai_core::types::Hash256;

use std::collections::BTreeMap;

/// One checkpoint record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: Hash256,
    /// [`UtxoSet::digest`](xai_core::utxo::UtxoSet::digest) at this height.
    pub utxo_digest: Hash256,
    /// Total coinbase issuance up to and including this height.
    pub supply: u64,
}

/// Rolling window of recent checkpoints.
pub struct CheckpointManager {
    interval: u64,
    max_retained: usize,
    checkpoints: BTreeMap<u64, Checkpoint>,
}

impl CheckpointManager {
    pub fn new(config: &Config) -> Self {
        Self {
            interval: config.checkpoint_interval,
            max_retained: config.max_checkpoints,
            checkpoints: BTreeMap::new(),
        }
    }

    /// Rebuild from persisted records, dropping any beyond the retention
    /// window.
    pub fn from_records(config: &Config, records: Vec<Checkpoint>) -> Self {
        let mut manager = Self::new(config);
        for record in records {
            manager.checkpoints.insert(record.height, record);
        }
        manager.prune();
        manager
    }

    /// Whether a checkpoint is due at `height`.
    pub fn is_due(&self, height: u64) -> bool {
        height != 0 && height % self.interval == 0
    }

    /// Record a checkpoint. Returns the heights evicted from the retention
    /// window so the storage layer can delete their files.
    pub fn record(&mut self, checkpoint: Checkpoint) -> Vec<u64> {
        self.checkpoints.insert(checkpoint.height, checkpoint);
        self.prune()
    }

    fn prune(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        while self.checkpoints.len() > self.max_retained {
            let oldest = *self.checkpoints.keys().next().expect("non-empty");
            self.checkpoints.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    /// The most recent checkpoint, if any.
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.values().next_back()
    }

    /// Height of the most recent checkpoint, 0 if none exist.
    pub fn last_checkpoint_height(&self) -> u64 {
        self.latest().map(|c| c.height).unwrap_or(0)
    }

    /// Guard a reorg: the fork point must lie strictly above the latest
    /// checkpoint.
    pub fn check_fork_point(&self, fork_height: u64) -> Result<(), ForkError> {
        let checkpoint = self.last_checkpoint_height();
        if checkpoint > 0 && fork_height <= checkpoint {
            return Err(ForkError::ForkBeforeCheckpoint { fork: fork_height, checkpoint });
        }
        Ok(())
    }

    pub fn get(&self, height: u64) -> Option<&Checkpoint> {
        self.checkpoints.get(&height)
    }

    /// All retained checkpoints in height order.
    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.values()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}
