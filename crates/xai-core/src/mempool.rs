//! In-memory pool of unconfirmed transactions.
//!
//! The mempool stores validated transactions awaiting block inclusion:
//!
//! - O(1) lookup by txid and conflict detection via a spent-outpoint index
//! - fee-rate-ordered selection for block templates, ties broken by earliest
//!   admission and then txid
//! - per-sender caps, minimum fee-rate floor, TTL expiry, and
//!   lowest-fee-rate eviction when full
//! - replace-by-fee for entries that opted in
//!
//! Transactions must pass contextual validation
//! ([`validate_transaction`](crate::validation::validate_transaction)) before
//! insertion; the pool enforces only its own policy rules. Not thread-safe —
//! the blockchain facade wraps it in the mempool lock.
//!
//! [`BanTracker`] implements the sender penalty window: repeated invalid
//! submissions inside the window ban the sender for a configured period.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::address::Address;
use crate::config::Config;
use crate::error::MempoolError;
use crate::types::{Block, Hash256, OutPoint, Transaction};

/// Fee rate precision: rates are stored in milli-units per byte.
const FEE_RATE_PRECISION: u128 = 1_000;

/// Compute a fee rate in milli-units per byte.
pub fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

/// Priority key: iterated in reverse for selection (highest fee rate, then
/// earliest admission, then lowest txid).
type PriorityKey = (u64, Reverse<i64>, Reverse<Hash256>);

/// A transaction stored in the mempool with precomputed metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    /// Fee in base units.
    pub fee: u64,
    /// Serialized size in bytes.
    pub size: usize,
    /// Admission time (Unix seconds).
    pub admitted_at: i64,
    fee_rate: u64,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }

    fn priority_key(&self) -> PriorityKey {
        (self.fee_rate, Reverse(self.admitted_at), Reverse(self.txid))
    }
}

/// The unconfirmed transaction pool.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    by_outpoint: HashMap<OutPoint, Hash256>,
    by_sender: HashMap<Address, HashSet<Hash256>>,
    by_priority: BTreeSet<PriorityKey>,
    total_bytes: usize,

    max_size: usize,
    max_per_sender: usize,
    min_fee_rate: u64,
    max_age_secs: u64,
    rbf_min_fee_bump: u64,
}

impl Mempool {
    pub fn new(config: &Config) -> Self {
        Self {
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_sender: HashMap::new(),
            by_priority: BTreeSet::new(),
            total_bytes: 0,
            max_size: config.mempool_max_size,
            max_per_sender: config.mempool_max_per_sender,
            min_fee_rate: config.mempool_min_fee_rate,
            max_age_secs: config.mempool_max_age_secs,
            rbf_min_fee_bump: config.mempool_rbf_min_fee_bump,
        }
    }

    /// Admit a validated transaction.
    ///
    /// `fee` and `size` come from the caller's
    /// [`ValidatedTransaction`](crate::validation::ValidatedTransaction);
    /// `now` stamps the admission time. Handles replace-by-fee when the
    /// transaction names a `replaces_txid`, and evicts lower-fee-rate
    /// entries when the pool is full.
    pub fn insert(
        &mut self,
        tx: Transaction,
        fee: u64,
        size: usize,
        now: i64,
    ) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();

        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }

        let fee_rate = compute_fee_rate(fee, size);
        // Faucet mints carry no fee; the floor applies to everything else.
        if !tx.is_faucet() && fee_rate < self.min_fee_rate {
            return Err(MempoolError::FeeRateTooLow { rate: fee_rate, minimum: self.min_fee_rate });
        }

        // Replace-by-fee: validate the replacement against the original
        // before touching any state.
        let replaced = match tx.replaces_txid {
            Some(old_txid) => {
                self.check_rbf(&tx, txid, fee, old_txid)?;
                Some(old_txid)
            }
            None => None,
        };

        // Conflicts with pool entries other than the one being replaced.
        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(input) {
                if Some(*existing) != replaced {
                    return Err(MempoolError::Conflict {
                        new_txid: txid.to_string(),
                        existing_txid: existing.to_string(),
                        outpoint: input.to_string(),
                    });
                }
            }
        }

        let sender_count = self
            .by_sender
            .get(&tx.sender)
            .map(|s| s.len())
            .unwrap_or(0);
        let replacing_own = replaced
            .and_then(|old| self.entries.get(&old))
            .map(|e| e.tx.sender == tx.sender)
            .unwrap_or(false);
        if sender_count.saturating_sub(replacing_own as usize) >= self.max_per_sender {
            return Err(MempoolError::SenderCapExceeded {
                sender: tx.sender.to_string(),
                cap: self.max_per_sender,
            });
        }

        if let Some(old) = replaced {
            self.remove_entry(old);
        }

        // Full pool: evict strictly lower fee-rate entries, or reject.
        while self.entries.len() >= self.max_size && !self.entries.is_empty() {
            let &(lowest_rate, _, Reverse(lowest_txid)) =
                self.by_priority.iter().next().expect("non-empty pool has a priority entry");
            if lowest_rate >= fee_rate {
                return Err(MempoolError::PoolFull);
            }
            self.remove_entry(lowest_txid);
        }
        if self.entries.len() >= self.max_size {
            return Err(MempoolError::PoolFull);
        }

        let entry = MempoolEntry { tx, txid, fee, size, admitted_at: now, fee_rate };
        for input in &entry.tx.inputs {
            self.by_outpoint.insert(input.clone(), txid);
        }
        self.by_sender
            .entry(entry.tx.sender.clone())
            .or_default()
            .insert(txid);
        self.by_priority.insert(entry.priority_key());
        self.total_bytes += size;
        self.entries.insert(txid, entry);

        Ok(txid)
    }

    /// Replace-by-fee policy: original must exist, opt in, share the sender,
    /// have its inputs covered by the replacement, and be outbid by more
    /// than the configured bump.
    fn check_rbf(
        &self,
        tx: &Transaction,
        _txid: Hash256,
        fee: u64,
        old_txid: Hash256,
    ) -> Result<(), MempoolError> {
        let old = self
            .entries
            .get(&old_txid)
            .ok_or_else(|| MempoolError::RbfRejected("original not in pool".into()))?;
        if !old.tx.rbf_enabled {
            return Err(MempoolError::RbfRejected("original did not opt in".into()));
        }
        if old.tx.sender != tx.sender {
            return Err(MempoolError::RbfRejected("sender mismatch".into()));
        }
        let old_inputs: HashSet<&OutPoint> = old.tx.inputs.iter().collect();
        let new_inputs: HashSet<&OutPoint> = tx.inputs.iter().collect();
        if !old_inputs.is_subset(&new_inputs) {
            return Err(MempoolError::RbfRejected(
                "replacement must spend a superset of the original inputs".into(),
            ));
        }
        let required = old.fee.saturating_add(self.rbf_min_fee_bump);
        if fee <= required {
            return Err(MempoolError::RbfRejected(format!(
                "fee {fee} does not exceed original {} plus bump {}",
                old.fee, self.rbf_min_fee_bump
            )));
        }
        Ok(())
    }

    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(input);
        }
        if let Some(set) = self.by_sender.get_mut(&entry.tx.sender) {
            set.remove(&txid);
            if set.is_empty() {
                self.by_sender.remove(&entry.tx.sender);
            }
        }
        self.by_priority.remove(&entry.priority_key());
        self.total_bytes -= entry.size;
        Some(entry)
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Whether any input of `tx` is already spent by a pool entry.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        tx.inputs.iter().any(|i| self.by_outpoint.contains_key(i))
    }

    /// Number of pool entries from `sender`.
    pub fn sender_count(&self, sender: &Address) -> usize {
        self.by_sender.get(sender).map(|s| s.len()).unwrap_or(0)
    }

    /// Select transactions for a block template in priority order.
    ///
    /// Highest fee rate first; ties broken by earliest admission, then txid.
    /// Selection stops at the first transaction that would overflow
    /// `max_bytes` or `max_count`.
    pub fn select_for_block(&self, max_bytes: usize, max_count: usize) -> Vec<&MempoolEntry> {
        let mut selected = Vec::new();
        let mut used_bytes = 0usize;

        for key in self.by_priority.iter().rev() {
            let (_, _, Reverse(txid)) = key;
            let entry = &self.entries[txid];
            if selected.len() + 1 > max_count || used_bytes + entry.size > max_bytes {
                break;
            }
            used_bytes += entry.size;
            selected.push(entry);
        }
        selected
    }

    /// Drop entries older than the configured TTL. Returns the evicted txids.
    pub fn expire(&mut self, now: i64) -> Vec<Hash256> {
        let cutoff = now - self.max_age_secs as i64;
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.admitted_at < cutoff)
            .map(|e| e.txid)
            .collect();
        for txid in &stale {
            self.remove_entry(*txid);
        }
        stale
    }

    /// Drop entries with a fee rate strictly below `rate`.
    pub fn evict_below(&mut self, rate: u64) -> Vec<Hash256> {
        let evicted: Vec<Hash256> = self
            .by_priority
            .iter()
            .take_while(|(r, _, _)| *r < rate)
            .map(|(_, _, Reverse(txid))| *txid)
            .collect();
        for txid in &evicted {
            self.remove_entry(*txid);
        }
        evicted
    }

    /// Remove transactions confirmed in `block` and any pool entries that
    /// conflict with the block's spent outpoints.
    pub fn remove_confirmed_block(&mut self, block: &Block) {
        let mut spent: HashSet<OutPoint> = HashSet::new();
        for tx in &block.transactions {
            self.remove_entry(tx.txid());
            spent.extend(tx.inputs.iter().cloned());
        }
        let conflicting: Vec<Hash256> = spent
            .iter()
            .filter_map(|op| self.by_outpoint.get(op).copied())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for txid in conflicting {
            self.remove_entry(txid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_fees(&self) -> u64 {
        self.entries.values().map(|e| e.fee).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }

    /// Deep-copy all entries for persistence or reorg rollback.
    pub fn snapshot(&self) -> Vec<MempoolEntry> {
        self.entries.values().cloned().collect()
    }

    /// Replace the pool contents from a snapshot, rebuilding all indices.
    pub fn restore(&mut self, entries: Vec<MempoolEntry>) {
        self.entries.clear();
        self.by_outpoint.clear();
        self.by_sender.clear();
        self.by_priority.clear();
        self.total_bytes = 0;
        for entry in entries {
            for input in &entry.tx.inputs {
                self.by_outpoint.insert(input.clone(), entry.txid);
            }
            self.by_sender
                .entry(entry.tx.sender.clone())
                .or_default()
                .insert(entry.txid);
            self.by_priority.insert(entry.priority_key());
            self.total_bytes += entry.size;
            self.entries.insert(entry.txid, entry);
        }
    }
}

/// Per-sender invalid-submission penalty tracker.
///
/// A sender accumulating `threshold` failures inside the rolling window is
/// banned for `ban_secs`. A successful admission clears the sender's record.
#[derive(Debug, Default)]
pub struct BanTracker {
    failures: HashMap<Address, Vec<i64>>,
    banned_until: HashMap<Address, i64>,
    threshold: u32,
    window_secs: u64,
    ban_secs: u64,
}

impl BanTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            failures: HashMap::new(),
            banned_until: HashMap::new(),
            threshold: config.mempool_invalid_threshold,
            window_secs: config.mempool_invalid_window_secs,
            ban_secs: config.mempool_invalid_ban_secs,
        }
    }

    /// If `sender` is banned at `now`, the ban expiry time.
    pub fn banned_until(&self, sender: &Address, now: i64) -> Option<i64> {
        match self.banned_until.get(sender) {
            Some(&until) if until > now => Some(until),
            _ => None,
        }
    }

    /// Record an invalid submission. Returns the ban expiry if this failure
    /// tripped the threshold.
    pub fn record_failure(&mut self, sender: &Address, now: i64) -> Option<i64> {
        let cutoff = now - self.window_secs as i64;
        let window = self.failures.entry(sender.clone()).or_default();
        window.retain(|&t| t > cutoff);
        window.push(now);
        if window.len() >= self.threshold as usize {
            let until = now + self.ban_secs as i64;
            self.banned_until.insert(sender.clone(), until);
            window.clear();
            return Some(until);
        }
        None
    }

    /// Clear a sender's failure history after a successful admission.
    pub fn clear(&mut self, sender: &Address) {
        self.failures.remove(sender);
        self.banned_until.remove(sender);
    }

    /// Number of bans still in force at `now`.
    pub fn active_bans(&self, now: i64) -> usize {
        self.banned_until.values().filter(|&&until| until > now).count()
    }
}
