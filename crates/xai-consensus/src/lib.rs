//! # xai-consensus
//! Block production and validation pipeline, BFT-style finality, and
//! checkpoint management for the XAI protocol.

pub mod checkpoint;
pub mod engine;
pub mod finality;
