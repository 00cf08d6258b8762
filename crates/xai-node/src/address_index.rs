//! Secondary index: address → transaction history.
//!
//! Backed by RocksDB with a fixed-prefix extractor so per-address history
//! queries are a prefix seek. Keys are
//! `SHA256(address) || height(BE) || tx_index(BE) || role`, which makes a
//! forward iteration over one address's prefix chronological, gives O(log n)
//! seek to an offset, and keeps the sender and recipient legs of a
//! self-transfer distinct.
//!
//! The index is updated transactionally with block application and rolled
//! back symmetrically during reorgs; it can always be rebuilt from a chain
//! scan.

use std::path::Path;

use rocksdb::{Options, SliceTransform, WriteBatch, DB};
use sha2::{Digest, Sha256};

use xai_core::address::Address;
use xai_core::error::ChainError;
use xai_core::types::{Block, Hash256, Transaction};

/// Role discriminator in the key suffix.
const ROLE_SENDER: u8 = 0;
const ROLE_RECIPIENT: u8 = 1;

/// One history entry for an address.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct AddressIndexEntry {
    pub height: u64,
    pub tx_index: u32,
    pub txid: Hash256,
    /// Whether the address is the sender (`true`) or recipient (`false`).
    pub is_sender: bool,
    pub amount: u64,
    pub timestamp: i64,
}

/// RocksDB-backed address history index.
pub struct AddressIndex {
    db: DB,
}

fn storage_err(e: impl std::fmt::Display) -> ChainError {
    ChainError::Storage(e.to_string())
}

fn address_prefix(address: &Address) -> [u8; 32] {
    Sha256::digest(address.as_str().as_bytes()).into()
}

fn entry_key(address: &Address, height: u64, tx_index: u32, role: u8) -> [u8; 45] {
    let mut key = [0u8; 45];
    key[0..32].copy_from_slice(&address_prefix(address));
    key[32..40].copy_from_slice(&height.to_be_bytes());
    key[40..44].copy_from_slice(&tx_index.to_be_bytes());
    key[44] = role;
    key
}

/// The (address, role, amount) legs a transaction contributes to the index.
fn tx_legs(tx: &Transaction) -> Vec<(Address, u8, u64)> {
    let mut legs = Vec::with_capacity(2);
    if !tx.sender.is_coinbase() {
        legs.push((tx.sender.clone(), ROLE_SENDER, tx.amount.saturating_add(tx.fee)));
    }
    legs.push((tx.recipient.clone(), ROLE_RECIPIENT, tx.amount));
    legs
}

impl AddressIndex {
    /// Open (and create) the index database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_prefix_extractor(SliceTransform::create_fixed_prefix(32));
        let db = DB::open(&opts, path.as_ref()).map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Index every transaction of a connected block. Atomic via WriteBatch.
    pub fn index_block(&self, height: u64, block: &Block) -> Result<(), ChainError> {
        let mut batch = WriteBatch::default();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            for (address, role, amount) in tx_legs(tx) {
                let entry = AddressIndexEntry {
                    height,
                    tx_index: tx_index as u32,
                    txid,
                    is_sender: role == ROLE_SENDER,
                    amount,
                    timestamp: tx.timestamp,
                };
                let value = bincode::encode_to_vec(&entry, bincode::config::standard())
                    .map_err(storage_err)?;
                batch.put(entry_key(&address, height, tx_index as u32, role), value);
            }
        }
        self.db.write(batch).map_err(storage_err)?;
        Ok(())
    }

    /// Remove a disconnected block's entries (inverse of [`index_block`]).
    pub fn unindex_block(&self, height: u64, block: &Block) -> Result<(), ChainError> {
        let mut batch = WriteBatch::default();
        for (tx_index, tx) in block.transactions.iter().enumerate() {
            for (address, role, _) in tx_legs(tx) {
                batch.delete(entry_key(&address, height, tx_index as u32, role));
            }
        }
        self.db.write(batch).map_err(storage_err)?;
        Ok(())
    }

    /// Paginated history for an address, chronological order.
    pub fn history(
        &self,
        address: &Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AddressIndexEntry>, ChainError> {
        let prefix = address_prefix(address);
        let mut entries = Vec::with_capacity(limit);
        let iter = self.db.prefix_iterator(prefix);
        for (i, item) in iter.enumerate() {
            let (key, value) = item.map_err(storage_err)?;
            // The prefix iterator may run past the prefix range.
            if key.len() < 32 || key[0..32] != prefix {
                break;
            }
            if i < offset {
                continue;
            }
            if entries.len() == limit {
                break;
            }
            let (entry, _): (AddressIndexEntry, usize) =
                bincode::decode_from_slice(&value, bincode::config::standard())
                    .map_err(storage_err)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Drop everything and re-index the given chain from scratch.
    pub fn rebuild<'a>(
        &self,
        blocks: impl Iterator<Item = &'a Block>,
    ) -> Result<(), ChainError> {
        // Clear by full-range delete.
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator(rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(storage_err)?;
            batch.delete(key);
        }
        self.db.write(batch).map_err(storage_err)?;

        for block in blocks {
            self.index_block(block.header.index, block)?;
        }
        Ok(())
    }
}
