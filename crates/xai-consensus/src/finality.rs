//! BFT-style finality over the proof-of-work chain.
//!
//! A fixed validator set votes on block headers by signing the header hash.
//! Once the signatures collected for a hash represent at least the quorum
//! fraction of total voting power, a [`FinalityCertificate`] is issued and
//! the certificate's height becomes a floor below which no reorg may move
//! the chain.
//!
//! Votes may arrive in any order; certificate emission depends only on the
//! accumulated set. A validator signing two different headers at the same
//! height is reported to the registered [`SlashingSink`] with both headers
//! as evidence, and the conflicting vote is discarded.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use xai_core::address::Address;
use xai_core::crypto::PublicKey;
use xai_core::error::FinalityError;
use xai_core::traits::{SlashingEvidence, SlashingSink};
use xai_core::types::{BlockHeader, Hash256};

/// A finality validator: address, verification key, and weight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    /// Compressed secp256k1 public key (33 bytes).
    pub public_key: Vec<u8>,
    pub voting_power: u64,
}

/// A quorum of validator signatures making a block (and its prefix)
/// irreversible.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FinalityCertificate {
    pub block_hash: Hash256,
    pub block_height: u64,
    /// Voting power represented by the collected signatures.
    pub aggregated_power: u64,
    /// Validator address → compact signature over the header hash.
    pub signatures: BTreeMap<Address, Vec<u8>>,
}

/// Result of recording a vote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Whether this vote completed a certificate.
    pub finalized: bool,
    /// Voting power accumulated for the voted block hash.
    pub aggregated_power: u64,
}

/// Serializable pending/finalized state for persistence and snapshots.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalityState {
    pub certificates: Vec<FinalityCertificate>,
    /// block hash → (header, validator → signature).
    pub pending: Vec<(Hash256, BlockHeader, BTreeMap<Address, Vec<u8>>)>,
}

struct PendingVotes {
    header: BlockHeader,
    signatures: BTreeMap<Address, Vec<u8>>,
}

/// Validator-weighted vote aggregation and certificate issuance.
pub struct FinalityManager {
    validators: HashMap<Address, Validator>,
    total_power: u64,
    quorum_percent: u64,
    pending: HashMap<Hash256, PendingVotes>,
    /// Every header ever voted on, kept for slashing evidence.
    seen_headers: HashMap<Hash256, BlockHeader>,
    /// height → validator → voted hash, for double-vote detection.
    votes_by_height: HashMap<u64, HashMap<Address, Hash256>>,
    by_hash: HashMap<Hash256, FinalityCertificate>,
    by_height: BTreeMap<u64, FinalityCertificate>,
}

impl FinalityManager {
    /// Build a manager from the configured validator set.
    ///
    /// Fails on duplicate addresses, zero weights, unparseable keys, or an
    /// empty set — all configuration errors surfaced at startup.
    pub fn new(validators: Vec<Validator>, quorum_percent: u64) -> Result<Self, FinalityError> {
        if validators.is_empty() {
            return Err(FinalityError::InvalidValidatorSet("empty validator set".into()));
        }
        let mut map = HashMap::with_capacity(validators.len());
        let mut total_power = 0u64;
        for v in validators {
            if v.voting_power == 0 {
                return Err(FinalityError::InvalidValidatorSet(format!(
                    "validator {} has zero voting power",
                    v.address
                )));
            }
            PublicKey::from_bytes(&v.public_key).map_err(|_| {
                FinalityError::InvalidValidatorSet(format!(
                    "validator {} has an invalid public key",
                    v.address
                ))
            })?;
            total_power = total_power
                .checked_add(v.voting_power)
                .ok_or_else(|| FinalityError::InvalidValidatorSet("power overflow".into()))?;
            if map.insert(v.address.clone(), v).is_some() {
                return Err(FinalityError::InvalidValidatorSet("duplicate validator".into()));
            }
        }
        Ok(Self {
            validators: map,
            total_power,
            quorum_percent,
            pending: HashMap::new(),
            seen_headers: HashMap::new(),
            votes_by_height: HashMap::new(),
            by_hash: HashMap::new(),
            by_height: BTreeMap::new(),
        })
    }

    /// Voting power needed for a certificate.
    pub fn quorum_power(&self) -> u64 {
        // ceil(total * percent / 100)
        ((self.total_power as u128 * self.quorum_percent as u128).div_ceil(100)) as u64
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Record a validator's vote for `header`.
    ///
    /// Verifies the signature over the header hash, detects double votes
    /// (reported to `slashing`, vote discarded), and emits a certificate
    /// when the accumulated power reaches the quorum.
    pub fn record_vote(
        &mut self,
        validator: &Address,
        header: &BlockHeader,
        signature: &[u8],
        slashing: &dyn SlashingSink,
    ) -> Result<VoteOutcome, FinalityError> {
        let entry = self
            .validators
            .get(validator)
            .ok_or_else(|| FinalityError::UnknownValidator(validator.to_string()))?;

        let block_hash = header.hash();
        let pk = PublicKey::from_bytes(&entry.public_key)
            .map_err(|_| FinalityError::InvalidVoteSignature)?;
        pk.verify(&block_hash, signature)
            .map_err(|_| FinalityError::InvalidVoteSignature)?;

        // Double-vote detection: same validator, same height, different hash.
        self.seen_headers.entry(block_hash).or_insert_with(|| header.clone());
        let prior_hash = self
            .votes_by_height
            .get(&header.index)
            .and_then(|votes| votes.get(validator))
            .copied();
        if let Some(prior_hash) = prior_hash {
            if prior_hash != block_hash {
                warn!(
                    validator = %validator,
                    height = header.index,
                    "conflicting finality votes detected"
                );
                // The prior header may be unknown after a state reload that
                // only carried certificates; evidence needs both headers.
                if let Some(prior_header) = self.seen_headers.get(&prior_hash) {
                    slashing.report(SlashingEvidence {
                        validator: validator.clone(),
                        height: header.index,
                        evidence: [prior_header.clone(), header.clone()],
                    });
                }
                let aggregated_power = self
                    .pending
                    .get(&block_hash)
                    .map(|p| Self::power_of(&self.validators, &p.signatures))
                    .unwrap_or(0);
                return Ok(VoteOutcome { finalized: false, aggregated_power });
            }
        }
        self.votes_by_height
            .entry(header.index)
            .or_default()
            .insert(validator.clone(), block_hash);

        // Already certified: the vote is redundant.
        if self.by_hash.contains_key(&block_hash) {
            let aggregated_power = self.by_hash[&block_hash].aggregated_power;
            return Ok(VoteOutcome { finalized: true, aggregated_power });
        }

        let pending = self
            .pending
            .entry(block_hash)
            .or_insert_with(|| PendingVotes {
                header: header.clone(),
                signatures: BTreeMap::new(),
            });
        pending.signatures.insert(validator.clone(), signature.to_vec());

        let aggregated_power = Self::power_of(&self.validators, &pending.signatures);
        if aggregated_power >= self.quorum_power() {
            let pending = self.pending.remove(&block_hash).expect("just inserted");
            let certificate = FinalityCertificate {
                block_hash,
                block_height: header.index,
                aggregated_power,
                signatures: pending.signatures,
            };
            info!(
                height = header.index,
                %block_hash,
                aggregated_power,
                "finality certificate issued"
            );
            self.by_hash.insert(block_hash, certificate.clone());
            self.by_height.insert(header.index, certificate);
            return Ok(VoteOutcome { finalized: true, aggregated_power });
        }

        Ok(VoteOutcome { finalized: false, aggregated_power })
    }

    fn power_of(
        validators: &HashMap<Address, Validator>,
        signatures: &BTreeMap<Address, Vec<u8>>,
    ) -> u64 {
        signatures
            .keys()
            .filter_map(|a| validators.get(a))
            .fold(0u64, |acc, v| acc.saturating_add(v.voting_power))
    }

    /// Highest height covered by any certificate, or `None`.
    pub fn highest_finalized_height(&self) -> Option<u64> {
        self.by_height.keys().next_back().copied()
    }

    /// Whether the prefix up to and including `height` is finalized.
    pub fn is_finalized_height(&self, height: u64) -> bool {
        self.highest_finalized_height()
            .is_some_and(|h| height <= h)
    }

    /// Whether a specific block hash carries a certificate.
    pub fn is_finalized_hash(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Whether a reorg whose fork point is `height` is permitted.
    pub fn can_reorg_to_height(&self, height: u64) -> bool {
        match self.highest_finalized_height() {
            Some(finalized) => height >= finalized,
            None => true,
        }
    }

    pub fn certificate_by_hash(&self, hash: &Hash256) -> Option<&FinalityCertificate> {
        self.by_hash.get(hash)
    }

    pub fn certificate_by_height(&self, height: u64) -> Option<&FinalityCertificate> {
        self.by_height.get(&height)
    }

    /// Power accumulated so far for an uncertified hash.
    pub fn pending_power(&self, hash: &Hash256) -> u64 {
        self.pending
            .get(hash)
            .map(|p| Self::power_of(&self.validators, &p.signatures))
            .unwrap_or(0)
    }

    /// Export certificates and pending votes for persistence or snapshots.
    pub fn to_state(&self) -> FinalityState {
        FinalityState {
            certificates: self.by_hash.values().cloned().collect(),
            pending: self
                .pending
                .iter()
                .map(|(h, p)| (*h, p.header.clone(), p.signatures.clone()))
                .collect(),
        }
    }

    /// Restore certificates and pending votes from persisted state.
    ///
    /// Signatures are trusted here; they were verified when first recorded.
    pub fn load_state(&mut self, state: FinalityState) {
        self.pending.clear();
        self.seen_headers.clear();
        self.votes_by_height.clear();
        self.by_hash.clear();
        self.by_height.clear();
        for cert in state.certificates {
            for validator in cert.signatures.keys() {
                self.votes_by_height
                    .entry(cert.block_height)
                    .or_default()
                    .insert(validator.clone(), cert.block_hash);
            }
            self.by_height.insert(cert.block_height, cert.clone());
            self.by_hash.insert(cert.block_hash, cert);
        }
        for (hash, header, signatures) in state.pending {
            for validator in signatures.keys() {
                self.votes_by_height
                    .entry(header.index)
                    .or_default()
                    .insert(validator.clone(), hash);
            }
            self.seen_headers.insert(hash, header.clone());
            self.pending.insert(hash, PendingVotes { header, signatures });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use xai_core::crypto::KeyPair;
    use xai_core::traits::NullSlashing;

    struct RecordingSlashing {
        reports: Mutex<Vec<SlashingEvidence>>,
    }

    impl SlashingSink for RecordingSlashing {
        fn report(&self, evidence: SlashingEvidence) {
            self.reports.lock().unwrap().push(evidence);
        }
    }

    fn header(index: u64, seed: u8) -> BlockHeader {
        BlockHeader {
            index,
            previous_hash: Hash256([seed; 32]),
            merkle_root: Hash256([seed.wrapping_add(1); 32]),
            timestamp: 1_700_000_000 + index as i64,
            difficulty: 1,
            nonce: 0,
            version: 1,
            miner_pubkey: None,
            signature: None,
        }
    }

    /// Three equal-weight validators: quorum at 67% needs all ... of power
    /// 30 total 10 each → quorum_power = ceil(30*67/100) = 21 → 3 voters.
    /// Use powers 10/10/10 with two voters = 20 < 21, three = 30 ≥ 21.
    fn three_validators() -> (Vec<KeyPair>, FinalityManager) {
        let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
        let validators: Vec<Validator> = keys
            .iter()
            .map(|kp| Validator {
                address: kp.address("XAI"),
                public_key: kp.public_key().to_bytes().to_vec(),
                voting_power: 10,
            })
            .collect();
        let manager = FinalityManager::new(validators, 67).unwrap();
        (keys, manager)
    }

    fn vote(
        manager: &mut FinalityManager,
        kp: &KeyPair,
        header: &BlockHeader,
    ) -> VoteOutcome {
        let sig = kp.sign(&header.hash());
        manager
            .record_vote(&kp.address("XAI"), header, &sig, &NullSlashing)
            .unwrap()
    }

    // --- Construction ---

    #[test]
    fn rejects_empty_validator_set() {
        assert!(matches!(
            FinalityManager::new(vec![], 67),
            Err(FinalityError::InvalidValidatorSet(_))
        ));
    }

    #[test]
    fn rejects_zero_power() {
        let kp = KeyPair::generate();
        let v = Validator {
            address: kp.address("XAI"),
            public_key: kp.public_key().to_bytes().to_vec(),
            voting_power: 0,
        };
        assert!(FinalityManager::new(vec![v], 67).is_err());
    }

    #[test]
    fn rejects_bad_public_key() {
        let kp = KeyPair::generate();
        let v = Validator {
            address: kp.address("XAI"),
            public_key: vec![0; 10],
            voting_power: 1,
        };
        assert!(FinalityManager::new(vec![v], 67).is_err());
    }

    #[test]
    fn rejects_duplicate_validator() {
        let kp = KeyPair::generate();
        let v = Validator {
            address: kp.address("XAI"),
            public_key: kp.public_key().to_bytes().to_vec(),
            voting_power: 1,
        };
        assert!(FinalityManager::new(vec![v.clone(), v], 67).is_err());
    }

    #[test]
    fn quorum_power_rounds_up() {
        let (_, manager) = three_validators();
        assert_eq!(manager.total_power(), 30);
        assert_eq!(manager.quorum_power(), 21);
    }

    // --- Voting ---

    #[test]
    fn votes_accumulate_to_certificate() {
        let (keys, mut manager) = three_validators();
        let h = header(5, 1);

        let o1 = vote(&mut manager, &keys[0], &h);
        assert!(!o1.finalized);
        assert_eq!(o1.aggregated_power, 10);

        let o2 = vote(&mut manager, &keys[1], &h);
        assert!(!o2.finalized);
        assert_eq!(o2.aggregated_power, 20);

        let o3 = vote(&mut manager, &keys[2], &h);
        assert!(o3.finalized);
        assert_eq!(o3.aggregated_power, 30);

        assert!(manager.is_finalized_hash(&h.hash()));
        assert_eq!(manager.highest_finalized_height(), Some(5));
        let cert = manager.certificate_by_height(5).unwrap();
        assert_eq!(cert.block_hash, h.hash());
        assert_eq!(cert.signatures.len(), 3);
        assert_eq!(cert.aggregated_power, 30);
    }

    #[test]
    fn finalized_prefix_semantics() {
        let (keys, mut manager) = three_validators();
        let h = header(5, 1);
        for kp in &keys {
            vote(&mut manager, kp, &h);
        }
        assert!(manager.is_finalized_height(0));
        assert!(manager.is_finalized_height(5));
        assert!(!manager.is_finalized_height(6));
        // Reorgs must fork at or above the finalized height.
        assert!(!manager.can_reorg_to_height(4));
        assert!(manager.can_reorg_to_height(5));
        assert!(manager.can_reorg_to_height(6));
    }

    #[test]
    fn rejects_unknown_validator() {
        let (_, mut manager) = three_validators();
        let outsider = KeyPair::generate();
        let h = header(1, 1);
        let sig = outsider.sign(&h.hash());
        assert!(matches!(
            manager.record_vote(&outsider.address("XAI"), &h, &sig, &NullSlashing),
            Err(FinalityError::UnknownValidator(_))
        ));
    }

    #[test]
    fn rejects_bad_signature() {
        let (keys, mut manager) = three_validators();
        let h = header(1, 1);
        // Signature over a different header.
        let sig = keys[0].sign(&header(2, 2).hash());
        assert!(matches!(
            manager.record_vote(&keys[0].address("XAI"), &h, &sig, &NullSlashing),
            Err(FinalityError::InvalidVoteSignature)
        ));
    }

    #[test]
    fn duplicate_vote_is_idempotent() {
        let (keys, mut manager) = three_validators();
        let h = header(1, 1);
        vote(&mut manager, &keys[0], &h);
        let again = vote(&mut manager, &keys[0], &h);
        assert_eq!(again.aggregated_power, 10);
        assert!(!again.finalized);
    }

    #[test]
    fn double_vote_reported_and_discarded() {
        let (keys, mut manager) = three_validators();
        let slashing = RecordingSlashing { reports: Mutex::new(Vec::new()) };
        let h_a = header(5, 1);
        let h_b = header(5, 2); // same height, different hash
        assert_ne!(h_a.hash(), h_b.hash());

        let sig_a = keys[0].sign(&h_a.hash());
        manager
            .record_vote(&keys[0].address("XAI"), &h_a, &sig_a, &slashing)
            .unwrap();

        let sig_b = keys[0].sign(&h_b.hash());
        let outcome = manager
            .record_vote(&keys[0].address("XAI"), &h_b, &sig_b, &slashing)
            .unwrap();

        // The conflicting vote carries no weight.
        assert!(!outcome.finalized);
        assert_eq!(outcome.aggregated_power, 0);
        assert_eq!(manager.pending_power(&h_b.hash()), 0);

        let reports = slashing.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].validator, keys[0].address("XAI"));
        assert_eq!(reports[0].height, 5);
        assert_eq!(reports[0].evidence[0], h_a);
        assert_eq!(reports[0].evidence[1], h_b);
    }

    #[test]
    fn same_validator_different_heights_is_fine() {
        let (keys, mut manager) = three_validators();
        let slashing = RecordingSlashing { reports: Mutex::new(Vec::new()) };
        for height in [1, 2, 3] {
            let h = header(height, height as u8);
            let sig = keys[0].sign(&h.hash());
            manager
                .record_vote(&keys[0].address("XAI"), &h, &sig, &slashing)
                .unwrap();
        }
        assert!(slashing.reports.lock().unwrap().is_empty());
    }

    #[test]
    fn out_of_order_votes_still_certify() {
        let (keys, mut manager) = three_validators();
        let h = header(7, 3);
        // Votes land in reverse validator order; only the set matters.
        let o = vote(&mut manager, &keys[2], &h);
        assert!(!o.finalized);
        vote(&mut manager, &keys[1], &h);
        let last = vote(&mut manager, &keys[0], &h);
        assert!(last.finalized);
    }

    #[test]
    fn highest_finalized_tracks_maximum() {
        let (keys, mut manager) = three_validators();
        for height in [3, 8, 5] {
            let h = header(height, height as u8);
            for kp in &keys {
                vote(&mut manager, kp, &h);
            }
        }
        assert_eq!(manager.highest_finalized_height(), Some(8));
    }

    #[test]
    fn vote_after_certificate_reports_finalized() {
        let (keys, mut manager) = three_validators();
        let h = header(2, 1);
        for kp in &keys {
            vote(&mut manager, kp, &h);
        }
        // A second certificate-completing vote from validator 0 at the same
        // height and hash is redundant, not equivocation.
        let outcome = vote(&mut manager, &keys[0], &h);
        assert!(outcome.finalized);
        assert_eq!(outcome.aggregated_power, 30);
    }

    // --- Persistence round trip ---

    #[test]
    fn state_round_trip() {
        let (keys, mut manager) = three_validators();
        let certified = header(2, 1);
        for kp in &keys {
            vote(&mut manager, kp, &certified);
        }
        let partial = header(4, 2);
        vote(&mut manager, &keys[0], &partial);

        let state = manager.to_state();
        let (_, mut restored) = {
            // Rebuild with the same validator set.
            let validators: Vec<Validator> = keys
                .iter()
                .map(|kp| Validator {
                    address: kp.address("XAI"),
                    public_key: kp.public_key().to_bytes().to_vec(),
                    voting_power: 10,
                })
                .collect();
            (keys.clone(), FinalityManager::new(validators, 67).unwrap())
        };
        restored.load_state(state);

        assert_eq!(restored.highest_finalized_height(), Some(2));
        assert!(restored.is_finalized_hash(&certified.hash()));
        assert_eq!(restored.pending_power(&partial.hash()), 10);

        // Remaining votes on the partial block still certify it.
        vote(&mut restored, &keys[1], &partial);
        let last = vote(&mut restored, &keys[2], &partial);
        assert!(last.finalized);
    }

    #[test]
    fn serde_round_trip_state() {
        let (keys, mut manager) = three_validators();
        let h = header(2, 1);
        for kp in &keys {
            vote(&mut manager, kp, &h);
        }
        let state = manager.to_state();
        let json = serde_json::to_string(&state).unwrap();
        let decoded: FinalityState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, state);
    }
}
