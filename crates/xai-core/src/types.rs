//! Core protocol types: transactions, blocks, UTXO entries.
//!
//! All monetary values are in base units (1 XAI = 10^8 units).
//! Identities are SHA-256 over explicit little-endian canonical layouts so
//! that every node computes byte-identical hashes regardless of the disk
//! encoding in use.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::address::Address;
use crate::error::TransactionError;

/// A 32-byte SHA-256 hash value.
///
/// Used for transaction IDs, block header hashes, merkle roots, and state
/// digests.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used as the genesis previous-hash.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// SHA-256 of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within that transaction.
    pub vout: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Recipient address.
    pub address: Address,
    /// Value in base units.
    pub amount: u64,
}

/// Statically-dispatched transaction kind.
///
/// Replaces the original implementation's free-form metadata dictionary so
/// that invalid kind/field combinations are unrepresentable.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum TxType {
    /// Ordinary value transfer.
    #[default]
    Transfer,
    /// Block subsidy payout; first transaction of every block.
    Coinbase,
    /// Testnet-only mint of a fixed faucet amount.
    Faucet,
    /// Governance action referencing a proposal.
    Governance { proposal_id: String },
    /// Contract invocation with an opaque payload (execution is external).
    ContractCall { payload: Vec<u8> },
}

impl TxType {
    /// Canonical tag byte for hashing.
    fn tag(&self) -> u8 {
        match self {
            TxType::Transfer => 0,
            TxType::Coinbase => 1,
            TxType::Faucet => 2,
            TxType::Governance { .. } => 3,
            TxType::ContractCall { .. } => 4,
        }
    }
}

/// A transaction transferring value between addresses.
///
/// Inputs reference confirmed UTXOs owned by `sender`; outputs pay the
/// recipient and return change. The single signature covers the txid, which
/// commits to every field except the signature itself.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    /// Amount paid to the recipient, in base units.
    pub amount: u64,
    /// Fee paid to the miner, in base units.
    pub fee: u64,
    /// Sender's compressed secp256k1 public key (33 bytes). Empty for
    /// coinbase and faucet transactions.
    pub public_key: Vec<u8>,
    /// Per-sender monotonic sequence number.
    pub nonce: u64,
    pub tx_type: TxType,
    /// Creation time in Unix seconds.
    pub timestamp: i64,
    /// Spent outpoints. Empty for coinbase and faucet transactions.
    pub inputs: Vec<OutPoint>,
    /// Created outputs, in order.
    pub outputs: Vec<TxOutput>,
    /// Compact ECDSA signature (64 bytes) over the txid.
    pub signature: Option<Vec<u8>>,
    /// Whether this transaction opts in to replace-by-fee.
    pub rbf_enabled: bool,
    /// Txid of the mempool transaction this one replaces, if any.
    pub replaces_txid: Option<Hash256>,
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

impl Transaction {
    /// Canonical byte layout used as the txid preimage.
    ///
    /// Every field in declared order, integers little-endian, variable-length
    /// fields length-prefixed. The signature is excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(256);
        put_bytes(&mut data, self.sender.as_str().as_bytes());
        put_bytes(&mut data, self.recipient.as_str().as_bytes());
        data.extend_from_slice(&self.amount.to_le_bytes());
        data.extend_from_slice(&self.fee.to_le_bytes());
        put_bytes(&mut data, &self.public_key);
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.push(self.tx_type.tag());
        match &self.tx_type {
            TxType::Governance { proposal_id } => put_bytes(&mut data, proposal_id.as_bytes()),
            TxType::ContractCall { payload } => put_bytes(&mut data, payload),
            _ => {}
        }
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            data.extend_from_slice(input.txid.as_bytes());
            data.extend_from_slice(&input.vout.to_le_bytes());
        }
        data.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            put_bytes(&mut data, output.address.as_str().as_bytes());
            data.extend_from_slice(&output.amount.to_le_bytes());
        }
        data.push(self.rbf_enabled as u8);
        match &self.replaces_txid {
            Some(txid) => {
                data.push(1);
                data.extend_from_slice(txid.as_bytes());
            }
            None => data.push(0),
        }
        data
    }

    /// Compute the transaction ID: SHA-256 over the canonical bytes.
    pub fn txid(&self) -> Hash256 {
        Hash256::digest(&self.canonical_bytes())
    }

    /// Whether this is a coinbase transaction (subsidy payout, no inputs).
    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TxType::Coinbase && self.sender.is_coinbase()
    }

    /// Whether this is a testnet faucet mint.
    pub fn is_faucet(&self) -> bool {
        matches!(self.tx_type, TxType::Faucet)
    }

    /// Whether a sender signature is required (everything except coinbase
    /// and faucet mints).
    pub fn requires_signature(&self) -> bool {
        !self.is_coinbase() && !self.is_faucet()
    }

    /// Sum of all output values. Returns `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.amount))
    }

    /// Serialized size in bytes (canonical disk encoding).
    pub fn size(&self) -> Result<usize, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|v| v.len())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

/// Block header containing the proof-of-work puzzle.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Block height.
    pub index: u64,
    /// Hash of the previous block header.
    pub previous_hash: Hash256,
    /// SHA-256 merkle root of the block's txids.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Required leading zero hex nibbles of the header hash.
    pub difficulty: u32,
    /// Proof-of-work nonce.
    pub nonce: u64,
    /// Header format version; must be in the configured allowed set.
    pub version: u32,
    /// Miner's compressed public key, if the block is signed.
    pub miner_pubkey: Option<Vec<u8>>,
    /// Miner's compact ECDSA signature over the header hash.
    pub signature: Option<Vec<u8>>,
}

impl BlockHeader {
    /// Canonical byte layout used as the header hash preimage.
    ///
    /// Fields in declared order, integers little-endian, hashes fixed-width,
    /// miner pubkey length-prefixed. The signature is excluded so that
    /// signing does not change the block identity.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 * 32 + 4 * 8 + 40);
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(self.previous_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.version.to_le_bytes());
        match &self.miner_pubkey {
            Some(pk) => put_bytes(&mut data, pk),
            None => data.extend_from_slice(&0u64.to_le_bytes()),
        }
        data
    }

    /// Compute the block header hash: SHA-256 over the canonical bytes.
    pub fn hash(&self) -> Hash256 {
        Hash256::digest(&self.canonical_bytes())
    }
}

/// A complete block: header plus ordered transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// First transaction must be coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The coinbase transaction, if the block is non-empty.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    /// Serialized size in bytes (canonical disk encoding).
    pub fn size(&self) -> Result<usize, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(|v| v.len())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }
}

/// An entry in the unspent transaction output set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    /// Owner address.
    pub address: Address,
    /// Value in base units.
    pub amount: u64,
    /// Height of the block that created this output.
    pub block_height: u64,
    /// Whether the creating transaction was a coinbase.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Whether this UTXO can be spent at `current_height`.
    ///
    /// Coinbase outputs require `maturity` confirmations; everything else is
    /// always spendable.
    pub fn is_mature(&self, current_height: u64, maturity: u64) -> bool {
        if !self.is_coinbase {
            return true;
        }
        current_height.saturating_sub(self.block_height) >= maturity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    fn addr(seed: u8) -> Address {
        Address::from_payload_bytes("XAI", &[seed; 20])
    }

    fn sample_tx() -> Transaction {
        Transaction {
            sender: addr(0xAA),
            recipient: addr(0xBB),
            amount: 40 * COIN,
            fee: COIN,
            public_key: vec![2u8; 33],
            nonce: 0,
            tx_type: TxType::Transfer,
            timestamp: 1_700_000_000,
            inputs: vec![OutPoint { txid: Hash256([0x11; 32]), vout: 0 }],
            outputs: vec![
                TxOutput { address: addr(0xBB), amount: 40 * COIN },
                TxOutput { address: addr(0xAA), amount: 59 * COIN },
            ],
            signature: Some(vec![0u8; 64]),
            rbf_enabled: false,
            replaces_txid: None,
        }
    }

    fn sample_coinbase() -> Transaction {
        Transaction {
            sender: Address::coinbase(),
            recipient: addr(0xCC),
            amount: 12 * COIN,
            fee: 0,
            public_key: vec![],
            nonce: 0,
            tx_type: TxType::Coinbase,
            timestamp: 1_700_000_000,
            inputs: vec![],
            outputs: vec![TxOutput { address: addr(0xCC), amount: 12 * COIN }],
            signature: None,
            rbf_enabled: false,
            replaces_txid: None,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            index: 1,
            previous_hash: Hash256([0x22; 32]),
            merkle_root: Hash256([0x33; 32]),
            timestamp: 1_700_000_000,
            difficulty: 1,
            nonce: 0,
            version: 1,
            miner_pubkey: None,
            signature: None,
        }
    }

    // --- Hash256 ---

    #[test]
    fn hash256_zero_is_zero() {
        assert!(Hash256::ZERO.is_zero());
        assert!(!Hash256([1; 32]).is_zero());
    }

    #[test]
    fn hash256_hex_round_trip() {
        let h = Hash256([0xAB; 32]);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(Hash256::from_hex(&s), Some(h));
    }

    #[test]
    fn hash256_from_hex_rejects_garbage() {
        assert_eq!(Hash256::from_hex("zz"), None);
        assert_eq!(Hash256::from_hex("abcd"), None);
    }

    // --- Transaction identity ---

    #[test]
    fn txid_deterministic() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());
    }

    #[test]
    fn txid_ignores_signature() {
        let mut tx = sample_tx();
        let before = tx.txid();
        tx.signature = Some(vec![0xFF; 64]);
        assert_eq!(tx.txid(), before);
        tx.signature = None;
        assert_eq!(tx.txid(), before);
    }

    #[test]
    fn txid_commits_to_every_other_field() {
        let base = sample_tx();
        let mut changed = base.clone();
        changed.amount += 1;
        assert_ne!(base.txid(), changed.txid());

        let mut changed = base.clone();
        changed.nonce += 1;
        assert_ne!(base.txid(), changed.txid());

        let mut changed = base.clone();
        changed.rbf_enabled = true;
        assert_ne!(base.txid(), changed.txid());

        let mut changed = base.clone();
        changed.replaces_txid = Some(Hash256([9; 32]));
        assert_ne!(base.txid(), changed.txid());

        let mut changed = base.clone();
        changed.tx_type = TxType::Governance { proposal_id: "prop_1".into() };
        assert_ne!(base.txid(), changed.txid());
    }

    #[test]
    fn coinbase_detection() {
        assert!(sample_coinbase().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn transfer_with_coinbase_sender_is_not_coinbase() {
        // Forged sender without the coinbase tx_type must not qualify.
        let mut tx = sample_tx();
        tx.sender = Address::coinbase();
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn signature_requirement() {
        assert!(sample_tx().requires_signature());
        assert!(!sample_coinbase().requires_signature());
        let mut faucet = sample_coinbase();
        faucet.tx_type = TxType::Faucet;
        assert!(!faucet.requires_signature());
    }

    #[test]
    fn total_output_value_sums() {
        assert_eq!(sample_tx().total_output_value(), Some(99 * COIN));
    }

    #[test]
    fn total_output_value_overflow_is_none() {
        let mut tx = sample_tx();
        tx.outputs = vec![
            TxOutput { address: addr(1), amount: u64::MAX },
            TxOutput { address: addr(2), amount: 1 },
        ];
        assert_eq!(tx.total_output_value(), None);
    }

    // --- Header identity ---

    #[test]
    fn header_hash_deterministic() {
        assert_eq!(sample_header().hash(), sample_header().hash());
    }

    #[test]
    fn header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
    }

    #[test]
    fn header_hash_ignores_signature() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.signature = Some(vec![1u8; 64]);
        assert_eq!(h1.hash(), h2.hash());
    }

    #[test]
    fn header_hash_commits_to_miner_pubkey() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.miner_pubkey = Some(vec![2u8; 33]);
        assert_ne!(h1.hash(), h2.hash());
    }

    // --- UtxoEntry maturity ---

    #[test]
    fn coinbase_utxo_matures_at_threshold() {
        let entry = UtxoEntry {
            address: addr(1),
            amount: COIN,
            block_height: 100,
            is_coinbase: true,
        };
        assert!(!entry.is_mature(150, 100));
        assert!(entry.is_mature(200, 100));
        assert!(entry.is_mature(300, 100));
    }

    #[test]
    fn regular_utxo_always_mature() {
        let entry = UtxoEntry {
            address: addr(1),
            amount: COIN,
            block_height: 100,
            is_coinbase: false,
        };
        assert!(entry.is_mature(0, 100));
        assert!(entry.is_mature(100, 100));
    }

    // --- Canonical encodings round-trip ---

    #[test]
    fn bincode_round_trip_transaction() {
        let tx = sample_tx();
        let encoded = bincode::encode_to_vec(&tx, bincode::config::standard()).unwrap();
        let (decoded, _): (Transaction, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn bincode_round_trip_block() {
        let block = Block {
            header: sample_header(),
            transactions: vec![sample_coinbase(), sample_tx()],
        };
        let encoded = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();
        let (decoded, _): (Block, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(block, decoded);
    }

    #[test]
    fn bincode_round_trip_tx_type_variants() {
        let variants = vec![
            TxType::Transfer,
            TxType::Coinbase,
            TxType::Faucet,
            TxType::Governance { proposal_id: "prop_abc123".into() },
            TxType::ContractCall { payload: vec![1, 2, 3] },
        ];
        for t in variants {
            let encoded = bincode::encode_to_vec(&t, bincode::config::standard()).unwrap();
            let (decoded, _): (TxType, usize) =
                bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
            assert_eq!(t, decoded);
        }
    }

    #[test]
    fn json_round_trip_block() {
        let block = Block {
            header: sample_header(),
            transactions: vec![sample_coinbase()],
        };
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(block, decoded);
    }
}
