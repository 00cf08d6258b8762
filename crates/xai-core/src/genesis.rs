//! Genesis block construction.
//!
//! The genesis provider supplies either a fully serialized genesis block or
//! a [`GenesisSpec`] describing the premine outputs, timestamp, and
//! difficulty; [`build_genesis`] turns a spec into the deterministic block.
//! Every node constructing the same spec computes the identical block, and
//! the configuration may pin the expected hash
//! ([`Config::expected_genesis_hash`]) as a startup guard.

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::config::Config;
use crate::error::ConfigError;
use crate::merkle;
use crate::types::{Block, BlockHeader, Hash256, Transaction, TxOutput, TxType};

/// Message embedded in the genesis coinbase.
pub const GENESIS_MESSAGE: &str = "XAI genesis. A ledger is a promise kept in public.";

/// Default genesis timestamp: January 1, 2024 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200;

/// How a node obtains its genesis block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum GenesisProvider {
    /// A pre-built block, e.g. loaded from disk or received from a peer
    /// bundle.
    Block(Block),
    /// A construction spec; the block is built deterministically.
    Spec(GenesisSpec),
}

/// Deterministic genesis construction parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GenesisSpec {
    /// Premine outputs paid by the genesis coinbase.
    pub premine: Vec<TxOutput>,
    pub timestamp: i64,
    pub difficulty: u32,
}

impl GenesisSpec {
    /// The standard spec for a network: a single one-unit marker output to
    /// the [message address](genesis_marker_address), default timestamp,
    /// configured difficulty.
    pub fn standard(config: &Config) -> Self {
        Self {
            premine: vec![TxOutput {
                address: genesis_marker_address(config),
                amount: 1,
            }],
            timestamp: GENESIS_TIMESTAMP,
            difficulty: config.initial_difficulty,
        }
    }
}

/// Address derived from [`GENESIS_MESSAGE`]. Nobody holds its key, so the
/// marker output is unspendable and ties the chain to the message.
pub fn genesis_marker_address(config: &Config) -> Address {
    let digest = Hash256::digest(GENESIS_MESSAGE.as_bytes());
    Address::from_payload_bytes(config.network.address_prefix(), &digest.as_bytes()[..20])
}

/// Build the genesis block from a spec.
///
/// The coinbase pays the premine outputs. The header's nonce is zero:
/// genesis is defined, not mined, and the proof-of-work rule is waived for
/// it during startup verification.
pub fn build_genesis(spec: &GenesisSpec) -> Block {
    let premine_total = spec.premine.iter().map(|o| o.amount).sum();
    let coinbase = Transaction {
        sender: Address::coinbase(),
        recipient: spec
            .premine
            .first()
            .map(|o| o.address.clone())
            .unwrap_or_else(Address::coinbase),
        amount: premine_total,
        fee: 0,
        public_key: vec![],
        nonce: 0,
        tx_type: TxType::Coinbase,
        timestamp: spec.timestamp,
        inputs: vec![],
        outputs: spec.premine.clone(),
        signature: None,
        rbf_enabled: false,
        replaces_txid: None,
    };

    let txids = vec![coinbase.txid()];
    Block {
        header: BlockHeader {
            index: 0,
            previous_hash: Hash256::ZERO,
            merkle_root: merkle::merkle_root(&txids),
            timestamp: spec.timestamp,
            difficulty: spec.difficulty,
            nonce: 0,
            version: 1,
            miner_pubkey: None,
            signature: None,
        },
        transactions: vec![coinbase],
    }
}

/// Resolve a provider into the genesis block and check the configured pin.
pub fn resolve_genesis(
    provider: &GenesisProvider,
    config: &Config,
) -> Result<Block, ConfigError> {
    let block = match provider {
        GenesisProvider::Block(block) => block.clone(),
        GenesisProvider::Spec(spec) => build_genesis(spec),
    };
    if let Some(expected) = &config.expected_genesis_hash {
        let got = block.header.hash();
        if got != *expected {
            return Err(ConfigError::GenesisHashMismatch {
                expected: expected.to_string(),
                got: got.to_string(),
            });
        }
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    fn spec() -> GenesisSpec {
        GenesisSpec {
            premine: vec![
                TxOutput {
                    address: Address::from_payload_bytes("TXAI", &[1; 20]),
                    amount: 1_000 * COIN,
                },
                TxOutput {
                    address: Address::from_payload_bytes("TXAI", &[2; 20]),
                    amount: 500 * COIN,
                },
            ],
            timestamp: GENESIS_TIMESTAMP,
            difficulty: 2,
        }
    }

    #[test]
    fn build_is_deterministic() {
        assert_eq!(build_genesis(&spec()), build_genesis(&spec()));
        assert_eq!(
            build_genesis(&spec()).header.hash(),
            build_genesis(&spec()).header.hash()
        );
    }

    #[test]
    fn genesis_shape() {
        let block = build_genesis(&spec());
        assert_eq!(block.header.index, 0);
        assert!(block.header.previous_hash.is_zero());
        assert_eq!(block.header.difficulty, 2);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn coinbase_pays_premine() {
        let block = build_genesis(&spec());
        let cb = &block.transactions[0];
        assert_eq!(cb.outputs.len(), 2);
        assert_eq!(cb.total_output_value(), Some(1_500 * COIN));
        assert_eq!(cb.amount, 1_500 * COIN);
    }

    #[test]
    fn merkle_root_commits_to_coinbase() {
        let block = build_genesis(&spec());
        let txid = block.transactions[0].txid();
        assert_eq!(block.header.merkle_root, merkle::merkle_root(&[txid]));
    }

    #[test]
    fn different_premine_different_hash() {
        let a = build_genesis(&spec());
        let mut other = spec();
        other.premine[0].amount += 1;
        let b = build_genesis(&other);
        assert_ne!(a.header.hash(), b.header.hash());
    }

    #[test]
    fn resolve_spec_provider() {
        let config = Config::testnet();
        let provider = GenesisProvider::Spec(spec());
        let block = resolve_genesis(&provider, &config).unwrap();
        assert_eq!(block, build_genesis(&spec()));
    }

    #[test]
    fn resolve_block_provider() {
        let config = Config::testnet();
        let block = build_genesis(&spec());
        let resolved =
            resolve_genesis(&GenesisProvider::Block(block.clone()), &config).unwrap();
        assert_eq!(resolved, block);
    }

    #[test]
    fn hash_pin_accepts_match() {
        let block = build_genesis(&spec());
        let config = Config {
            expected_genesis_hash: Some(block.header.hash()),
            ..Config::testnet()
        };
        resolve_genesis(&GenesisProvider::Spec(spec()), &config).unwrap();
    }

    #[test]
    fn hash_pin_rejects_mismatch() {
        let config = Config {
            expected_genesis_hash: Some(Hash256([0xAB; 32])),
            ..Config::testnet()
        };
        assert!(matches!(
            resolve_genesis(&GenesisProvider::Spec(spec()), &config),
            Err(ConfigError::GenesisHashMismatch { .. })
        ));
    }

    #[test]
    fn standard_spec_validates_against_config() {
        let config = Config::testnet();
        let block = build_genesis(&GenesisSpec::standard(&config));
        assert_eq!(block.header.difficulty, config.initial_difficulty);
        assert!(!block.transactions[0].outputs.is_empty());
    }
}
