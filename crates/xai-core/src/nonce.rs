//! Per-sender transaction nonce tracking.
//!
//! Every sender's transactions carry a monotonically increasing nonce; the
//! tracker records the next expected value per sender and enforces exact
//! sequencing during block application. Snapshots mirror the UTXO set's
//! contract so reorgs can roll both back together.

use std::collections::HashMap;

use crate::address::Address;
use crate::error::TransactionError;
use crate::types::Hash256;

/// Deep-copied view of the nonce tracker used for reorg rollback.
#[derive(Clone, Debug)]
pub struct NonceSnapshot {
    next: HashMap<Address, u64>,
}

/// Next-expected-nonce map keyed by sender.
#[derive(Clone, Debug, Default)]
pub struct NonceTracker {
    next: HashMap<Address, u64>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next expected nonce for `sender` (0 for unseen senders).
    pub fn peek(&self, sender: &Address) -> u64 {
        self.next.get(sender).copied().unwrap_or(0)
    }

    /// Return the next nonce for `sender` and advance the counter.
    pub fn next(&mut self, sender: &Address) -> u64 {
        let entry = self.next.entry(sender.clone()).or_insert(0);
        let value = *entry;
        *entry += 1;
        value
    }

    /// Enforce that a confirmed transaction carries exactly the expected
    /// nonce, then advance.
    pub fn apply(&mut self, sender: &Address, nonce: u64) -> Result<(), TransactionError> {
        let expected = self.peek(sender);
        if nonce != expected {
            return Err(TransactionError::NonceMismatch {
                sender: sender.to_string(),
                expected,
                got: nonce,
            });
        }
        self.next.insert(sender.clone(), nonce + 1);
        Ok(())
    }

    pub fn snapshot(&self) -> NonceSnapshot {
        NonceSnapshot { next: self.next.clone() }
    }

    pub fn restore(&mut self, snapshot: NonceSnapshot) {
        self.next = snapshot.next;
    }

    /// Deterministic digest over sorted (sender, next) pairs.
    pub fn digest(&self) -> Hash256 {
        let mut keys: Vec<&Address> = self.next.keys().collect();
        keys.sort();
        let mut data = Vec::with_capacity(keys.len() * 48);
        for key in keys {
            data.extend_from_slice(key.as_str().as_bytes());
            data.extend_from_slice(&self.next[key].to_le_bytes());
        }
        Hash256::digest(&data)
    }

    /// Iterate over all (sender, next-nonce) pairs for persistence.
    pub fn iter(&self) -> impl Iterator<Item = (&Address, u64)> {
        self.next.iter().map(|(a, n)| (a, *n))
    }

    /// Rebuild from persisted pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (Address, u64)>) -> Self {
        Self { next: entries.into_iter().collect() }
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}
