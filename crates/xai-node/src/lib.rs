//! # xai-node
//! Full-node composition for the XAI protocol: the blockchain facade, disk
//! persistence, chain reorganization with write-ahead logging, the address
//! index, and the background miner.

pub mod address_index;
pub mod chain;
pub mod config;
pub mod miner;
pub mod reorg;
pub mod storage;

pub use chain::{Blockchain, BlockDisposition, NodeStats, StateSnapshot};
pub use config::NodeConfig;
