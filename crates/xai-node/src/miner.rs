//! Background mining.
//!
//! One mining thread per node: build a template from the mempool, grind
//! nonces until the difficulty is met or the stop flag is raised, submit the
//! block through the normal admission path, repeat. Cancellation is
//! cooperative with one-nonce granularity via the shared [`AtomicBool`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use xai_consensus::engine;
use xai_core::address::Address;
use xai_core::error::ChainError;
use xai_core::types::Block;

use crate::chain::Blockchain;

/// Handle to the background mining thread.
pub struct Miner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Miner {
    /// Spawn the mining loop paying rewards to `payout`.
    pub fn start(chain: Arc<Blockchain>, payout: Address) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("xai-miner".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match mine_next(&chain, &payout, &stop_flag) {
                        Ok(Some(block)) => {
                            debug!(height = block.header.index, "mined block");
                        }
                        Ok(None) => break, // interrupted
                        Err(e) => {
                            warn!(error = %e, "mining iteration failed");
                            std::thread::sleep(Duration::from_millis(250));
                        }
                    }
                }
            })
            .expect("spawn miner thread");
        Self { stop, handle: Some(handle) }
    }

    /// Signal the loop to stop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One template → mine → submit cycle. `Ok(None)` means interrupted.
fn mine_next(
    chain: &Blockchain,
    payout: &Address,
    stop: &AtomicBool,
) -> Result<Option<Block>, ChainError> {
    let mut block = chain.build_block_template(payout)?;
    if !engine::mine_block(&mut block, u64::MAX, stop) {
        return Ok(None);
    }
    chain.add_block(block.clone())?;
    chain.listener.block_mined(&block);
    Ok(Some(block))
}

/// Mine exactly one block synchronously (used by tests and the faucet-style
/// tooling on testnet).
pub fn mine_one(chain: &Blockchain, payout: &Address) -> Result<Block, ChainError> {
    let stop = AtomicBool::new(false);
    let mut block = chain.build_block_template(payout)?;
    if !engine::mine_block(&mut block, u64::MAX, &stop) {
        return Err(ChainError::Storage("nonce space exhausted".into()));
    }
    chain.add_block(block.clone())?;
    chain.listener.block_mined(&block);
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use xai_core::config::Config;
    use xai_core::genesis::{GenesisProvider, GenesisSpec};
    use xai_core::traits::EventListener;
    use xai_core::types::Hash256;

    use crate::chain::{BlockchainOptions, NodeStats};
    use crate::config::NodeConfig;

    fn test_config() -> Config {
        Config { initial_difficulty: 0, ..Config::testnet() }
    }

    fn open_chain(dir: &TempDir) -> Blockchain {
        let node_config = NodeConfig::at(dir.path(), test_config());
        let provider = GenesisProvider::Spec(GenesisSpec::standard(&node_config.chain));
        Blockchain::open(&node_config, &provider).unwrap()
    }

    fn payout() -> Address {
        Address::from_payload_bytes("TXAI", &[0xAA; 20])
    }

    #[test]
    fn mine_one_extends_chain() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        assert_eq!(chain.height(), 0);

        let block = mine_one(&chain, &payout()).unwrap();
        assert_eq!(block.header.index, 1);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip_hash(), block.header.hash());
    }

    #[test]
    fn mine_several_blocks_pays_miner() {
        let dir = TempDir::new().unwrap();
        let chain = open_chain(&dir);
        for _ in 0..3 {
            mine_one(&chain, &payout()).unwrap();
        }
        assert_eq!(chain.height(), 3);
        // Three subsidies to the payout address.
        assert_eq!(
            chain.get_balance(&payout()),
            3 * chain.config().initial_block_reward
        );
    }

    struct MinedListener {
        mined: Mutex<Vec<Hash256>>,
    }

    impl EventListener for MinedListener {
        fn block_mined(&self, block: &Block) {
            self.mined.lock().unwrap().push(block.header.hash());
        }
    }

    #[test]
    fn mine_one_emits_event() {
        let dir = TempDir::new().unwrap();
        let node_config = NodeConfig::at(dir.path(), test_config());
        let provider = GenesisProvider::Spec(GenesisSpec::standard(&node_config.chain));
        let listener = Arc::new(MinedListener { mined: Mutex::new(Vec::new()) });
        let chain = Blockchain::open_with(
            &node_config,
            &provider,
            BlockchainOptions {
                listener: listener.clone(),
                ..BlockchainOptions::default()
            },
        )
        .unwrap();

        let block = mine_one(&chain, &payout()).unwrap();
        assert_eq!(listener.mined.lock().unwrap().as_slice(), &[block.header.hash()]);
    }

    #[test]
    fn background_miner_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let chain = Arc::new(open_chain(&dir));
        let miner = Miner::start(Arc::clone(&chain), payout());
        // Give it a moment to mine at least one trivial-difficulty block.
        std::thread::sleep(Duration::from_millis(200));
        miner.stop();
        let NodeStats { height, .. } = chain.get_stats();
        assert!(height >= 1, "miner should have produced at least one block");
    }
}
