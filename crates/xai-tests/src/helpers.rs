//! Test fixtures: disposable nodes with controllable clocks, funded
//! wallets, and fork construction.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use xai_consensus::finality::Validator;
use xai_core::address::Address;
use xai_core::config::Config;
use xai_core::crypto::{self, KeyPair};
use xai_core::genesis::{GenesisProvider, GenesisSpec, GENESIS_TIMESTAMP};
use xai_core::types::{Block, OutPoint, Transaction, TxOutput, TxType};
use xai_node::chain::{Blockchain, BlockchainOptions};
use xai_node::config::NodeConfig;
use xai_node::miner;

/// Testnet parameters with trivial PoW and instantly spendable coinbases,
/// so scenarios focus on the rules under test.
pub fn test_config() -> Config {
    Config {
        initial_difficulty: 0,
        coinbase_maturity: 0,
        ..Config::testnet()
    }
}

/// A shared, manually advanced clock.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicI64>);

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::Relaxed);
    }

    pub fn as_fn(&self) -> Box<dyn Fn() -> i64 + Send + Sync> {
        let inner = Arc::clone(&self.0);
        Box::new(move || inner.load(Ordering::Relaxed))
    }
}

/// A disposable node: temp directory, deterministic clock, shared genesis.
pub struct TestNode {
    pub dir: TempDir,
    pub node_config: NodeConfig,
    pub genesis: GenesisSpec,
    pub validators: Option<Vec<Validator>>,
    pub clock: TestClock,
    pub chain: Blockchain,
}

impl TestNode {
    /// Open a node with the standard test config and the given premine.
    pub fn with_premine(premine: Vec<TxOutput>) -> Self {
        Self::build(test_config(), premine, None)
    }

    /// Open a node with finality validators.
    pub fn with_validators(premine: Vec<TxOutput>, validators: Vec<Validator>) -> Self {
        Self::build(test_config(), premine, Some(validators))
    }

    /// Open a node with a custom protocol config.
    pub fn with_config(config: Config, premine: Vec<TxOutput>) -> Self {
        Self::build(config, premine, None)
    }

    fn build(config: Config, premine: Vec<TxOutput>, validators: Option<Vec<Validator>>) -> Self {
        let genesis = GenesisSpec {
            premine,
            timestamp: GENESIS_TIMESTAMP,
            difficulty: config.initial_difficulty,
        };
        let dir = TempDir::new().expect("create temp dir");
        let node_config = NodeConfig::at(dir.path(), config);
        let clock = TestClock::new(GENESIS_TIMESTAMP + 1_000);
        let chain = Blockchain::open_with(
            &node_config,
            &GenesisProvider::Spec(genesis.clone()),
            BlockchainOptions {
                validators: validators.clone(),
                clock: clock.as_fn(),
                ..BlockchainOptions::default()
            },
        )
        .expect("open test chain");
        Self { dir, node_config, genesis, validators, clock, chain }
    }

    /// Mine one block to `payout`, advancing the clock one block interval
    /// first so timestamps stay distinct and monotonic.
    pub fn mine(&self, payout: &Address) -> Block {
        self.clock.advance(120);
        miner::mine_one(&self.chain, payout).expect("mine block")
    }

    /// Spawn a second node sharing this node's genesis and chain prefix up
    /// to `shared_height`, with its clock slightly ahead.
    pub fn fork_from(&self, shared_height: u64) -> TestNode {
        let dir = TempDir::new().expect("create temp dir");
        let node_config = NodeConfig::at(dir.path(), self.node_config.chain.clone());
        let clock = TestClock::new(self.clock.now() + 1);
        let chain = Blockchain::open_with(
            &node_config,
            &GenesisProvider::Spec(self.genesis.clone()),
            BlockchainOptions {
                validators: self.validators.clone(),
                clock: clock.as_fn(),
                ..BlockchainOptions::default()
            },
        )
        .expect("open fork chain");
        for height in 1..=shared_height {
            let block = self
                .chain
                .get_block(height)
                .expect("read block")
                .expect("block exists");
            chain.add_block(block).expect("replay shared prefix");
        }
        TestNode {
            dir,
            node_config,
            genesis: self.genesis.clone(),
            validators: self.validators.clone(),
            clock,
            chain,
        }
    }

    /// Close and reopen the node from the same data directory, simulating a
    /// process restart.
    pub fn reopen(self) -> TestNode {
        let TestNode { dir, node_config, genesis, validators, clock, chain } = self;
        drop(chain);
        let chain = Blockchain::open_with(
            &node_config,
            &GenesisProvider::Spec(genesis.clone()),
            BlockchainOptions {
                validators: validators.clone(),
                clock: clock.as_fn(),
                ..BlockchainOptions::default()
            },
        )
        .expect("reopen chain");
        TestNode { dir, node_config, genesis, validators, clock, chain }
    }
}

/// A fixed test address.
pub fn addr(seed: u8) -> Address {
    Address::from_payload_bytes("TXAI", &[seed; 20])
}

/// A funded wallet and its node: genesis premines `amount` to the keypair.
pub fn funded_node(amount: u64) -> (TestNode, KeyPair) {
    let kp = KeyPair::generate();
    let node = TestNode::with_premine(vec![TxOutput {
        address: kp.address("TXAI"),
        amount,
    }]);
    (node, kp)
}

/// Hand-build and sign a transfer spending explicit inputs, with change
/// back to the sender.
pub fn manual_transfer(
    kp: &KeyPair,
    inputs: Vec<(OutPoint, u64)>,
    recipient: Address,
    amount: u64,
    fee: u64,
    nonce: u64,
    timestamp: i64,
) -> Transaction {
    let sender = kp.address("TXAI");
    let total: u64 = inputs.iter().map(|(_, v)| v).sum();
    let mut outputs = vec![TxOutput { address: recipient.clone(), amount }];
    let change = total - amount - fee;
    if change > 0 {
        outputs.push(TxOutput { address: sender.clone(), amount: change });
    }
    let mut tx = Transaction {
        sender,
        recipient,
        amount,
        fee,
        public_key: vec![],
        nonce,
        tx_type: TxType::Transfer,
        timestamp,
        inputs: inputs.into_iter().map(|(op, _)| op).collect(),
        outputs,
        signature: None,
        rbf_enabled: false,
        replaces_txid: None,
    };
    crypto::sign_transaction(&mut tx, kp);
    tx
}

/// Build a validator set of `n` equal-weight validators.
pub fn validator_set(n: usize, power: u64) -> (Vec<KeyPair>, Vec<Validator>) {
    let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
    let validators = keys
        .iter()
        .map(|kp| Validator {
            address: kp.address("TXAI"),
            public_key: kp.public_key().to_bytes().to_vec(),
            voting_power: power,
        })
        .collect();
    (keys, validators)
}
