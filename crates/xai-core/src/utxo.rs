//! Unspent transaction output set.
//!
//! The UTXO set is the authoritative spendable-value state of the chain.
//! Mutation happens only while applying or rewinding confirmed blocks under
//! the chain lock; [`snapshot`](UtxoSet::snapshot) / [`restore`](UtxoSet::restore)
//! give reorgs an all-or-nothing fallback.
//!
//! The optimistic input locks ([`lock`](UtxoSet::lock) / [`unlock`](UtxoSet::unlock))
//! are an in-memory reservation preventing two concurrent wallet calls from
//! selecting the same inputs; they are not part of consensus state and are
//! excluded from snapshots and digests.
//!
//! Not thread-safe on its own — the blockchain facade wraps it in the chain
//! lock.

use std::collections::{HashMap, HashSet};

use crate::address::Address;
use crate::error::UtxoError;
use crate::types::{Hash256, OutPoint, Transaction, UtxoEntry};

/// Deep-copied view of the UTXO set used for reorg rollback.
#[derive(Clone, Debug)]
pub struct UtxoSnapshot {
    entries: HashMap<OutPoint, UtxoEntry>,
}

/// The unspent output set.
#[derive(Debug, Default)]
pub struct UtxoSet {
    entries: HashMap<OutPoint, UtxoEntry>,
    /// Optimistic reservations held by in-flight transaction builders.
    locked: HashSet<OutPoint>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one UTXO per output of `tx`, created at `height`.
    pub fn apply_outputs(&mut self, tx: &Transaction, height: u64) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (vout, output) in tx.outputs.iter().enumerate() {
            self.entries.insert(
                OutPoint { txid, vout: vout as u32 },
                UtxoEntry {
                    address: output.address.clone(),
                    amount: output.amount,
                    block_height: height,
                    is_coinbase,
                },
            );
        }
    }

    /// Consume every input of `tx`.
    ///
    /// Fails atomically: if any input is missing the set is left untouched.
    /// Returns the consumed entries in input order (restoration data for
    /// callers that rewind without a full snapshot) together with their
    /// value sum.
    pub fn apply_inputs(
        &mut self,
        tx: &Transaction,
    ) -> Result<(Vec<(OutPoint, UtxoEntry)>, u64), UtxoError> {
        // Validate before mutating so a mid-transaction failure cannot leave
        // a partial spend behind.
        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if !seen.insert(input) {
                return Err(UtxoError::DoubleSpend(input.to_string()));
            }
            if !self.entries.contains_key(input) {
                return Err(UtxoError::MissingUtxo(input.to_string()));
            }
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        let mut total = 0u64;
        for input in &tx.inputs {
            let entry = self.entries.remove(input).expect("presence checked above");
            self.locked.remove(input);
            total = total.saturating_add(entry.amount);
            spent.push((input.clone(), entry));
        }
        Ok((spent, total))
    }

    /// Re-insert previously consumed entries (inverse of [`apply_inputs`]).
    pub fn restore_entries(&mut self, entries: Vec<(OutPoint, UtxoEntry)>) {
        for (outpoint, entry) in entries {
            self.entries.insert(outpoint, entry);
        }
    }

    /// Remove the outputs a transaction created (inverse of [`apply_outputs`]).
    pub fn remove_outputs(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        for vout in 0..tx.outputs.len() {
            self.entries.remove(&OutPoint { txid, vout: vout as u32 });
        }
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    /// Sum of unspent outputs owned by `address`.
    pub fn get_balance(&self, address: &Address) -> u64 {
        self.entries
            .values()
            .filter(|e| &e.address == address)
            .fold(0u64, |acc, e| acc.saturating_add(e.amount))
    }

    /// Unspent outpoints owned by `address`, with entries.
    pub fn find_spendable(&self, address: &Address) -> Vec<(OutPoint, UtxoEntry)> {
        let mut found: Vec<(OutPoint, UtxoEntry)> = self
            .entries
            .iter()
            .filter(|(op, e)| &e.address == address && !self.locked.contains(op))
            .map(|(op, e)| (op.clone(), e.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Reserve inputs for an in-flight transaction build.
    ///
    /// Fails without reserving anything if any input is already reserved or
    /// does not exist.
    pub fn lock(&mut self, inputs: &[OutPoint]) -> Result<(), UtxoError> {
        for input in inputs {
            if !self.entries.contains_key(input) {
                return Err(UtxoError::MissingUtxo(input.to_string()));
            }
            if self.locked.contains(input) {
                return Err(UtxoError::LockConflict(input.to_string()));
            }
        }
        self.locked.extend(inputs.iter().cloned());
        Ok(())
    }

    /// Release previously reserved inputs. Unknown inputs are ignored.
    pub fn unlock(&mut self, inputs: &[OutPoint]) {
        for input in inputs {
            self.locked.remove(input);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deep-copy the consensus state (reservations excluded).
    pub fn snapshot(&self) -> UtxoSnapshot {
        UtxoSnapshot { entries: self.entries.clone() }
    }

    /// Atomically replace the live state with a snapshot.
    ///
    /// Reservations are cleared: any in-flight builder was working against
    /// state that no longer exists.
    pub fn restore(&mut self, snapshot: UtxoSnapshot) {
        self.entries = snapshot.entries;
        self.locked.clear();
    }

    /// Deterministic SHA-256 digest of the current set.
    ///
    /// Entries are folded in sorted outpoint order so two sets with equal
    /// contents always produce equal digests.
    pub fn digest(&self) -> Hash256 {
        let mut keys: Vec<&OutPoint> = self.entries.keys().collect();
        keys.sort();
        let mut data = Vec::with_capacity(keys.len() * 96);
        for key in keys {
            let entry = &self.entries[key];
            data.extend_from_slice(key.txid.as_bytes());
            data.extend_from_slice(&key.vout.to_le_bytes());
            data.extend_from_slice(entry.address.as_str().as_bytes());
            data.extend_from_slice(&entry.amount.to_le_bytes());
            data.extend_from_slice(&entry.block_height.to_le_bytes());
            data.push(entry.is_coinbase as u8);
        }
        Hash256::digest(&data)
    }

    /// Iterate over all entries (arbitrary order).
    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }
}
