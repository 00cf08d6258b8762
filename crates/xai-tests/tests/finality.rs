//! Validator finality: certificates, reorg floors, and persistence.

use xai_core::constants::COIN;
use xai_core::error::{ChainError, FinalityError, ForkError};
use xai_core::types::TxOutput;
use xai_node::chain::{BlockDisposition, BlockId};

use xai_tests::helpers::{addr, validator_set, TestNode};

fn premine() -> Vec<TxOutput> {
    vec![TxOutput { address: addr(0x01), amount: 100 * COIN }]
}

#[test]
fn quorum_votes_finalize_a_block() {
    let (keys, validators) = validator_set(3, 10);
    let node = TestNode::with_validators(premine(), validators);
    let miner = addr(0xA0);
    for _ in 0..5 {
        node.mine(&miner);
    }

    let header = node.chain.get_header(5).unwrap();
    let hash = header.hash();

    // Two of three validators: 20 of 30 power, below the 67% quorum.
    for kp in &keys[..2] {
        let outcome = node
            .chain
            .submit_finality_vote(&kp.address("TXAI"), BlockId::Height(5), &kp.sign(&hash))
            .unwrap();
        assert!(!outcome.finalized);
    }
    assert!(!node.chain.is_finalized(BlockId::Height(5)));

    // The third vote crosses the quorum.
    let outcome = node
        .chain
        .submit_finality_vote(&keys[2].address("TXAI"), BlockId::Height(5), &keys[2].sign(&hash))
        .unwrap();
    assert!(outcome.finalized);
    assert_eq!(outcome.aggregated_power, 30);

    // The certificate covers the prefix.
    assert!(node.chain.is_finalized(BlockId::Height(5)));
    assert!(node.chain.is_finalized(BlockId::Height(3)));
    assert!(node.chain.is_finalized(BlockId::Hash(hash)));
    assert!(!node.chain.is_finalized(BlockId::Height(6)));
    assert_eq!(node.chain.highest_finalized_height(), Some(5));
    assert_eq!(node.chain.get_stats().finalized_height, Some(5));
}

#[test]
fn finality_blocks_deeper_reorg() {
    let (keys, validators) = validator_set(3, 10);
    let node_a = TestNode::with_validators(premine(), validators);
    let miner_a = addr(0xA0);
    let miner_b = addr(0xB0);
    for _ in 0..5 {
        node_a.mine(&miner_a);
    }

    // Finalize height 5.
    let header = node_a.chain.get_header(5).unwrap();
    let hash = header.hash();
    for kp in &keys {
        node_a
            .chain
            .submit_finality_vote(&kp.address("TXAI"), BlockId::Height(5), &kp.sign(&hash))
            .unwrap();
    }
    assert_eq!(node_a.chain.highest_finalized_height(), Some(5));
    let tip = node_a.chain.tip_hash();

    // A long fork from height 4 — heavier, but below the finalized floor.
    let node_b = node_a.fork_from(4);
    let b5 = node_b.mine(&miner_b);
    let err = node_a.chain.add_block(b5).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Fork(ForkError::ForkBeforeFinalized { fork: 4, finalized: 5 })
    ));

    // Ten more fork blocks change nothing: their lineage is never accepted.
    for _ in 0..10 {
        let block = node_b.mine(&miner_b);
        match node_a.chain.add_block(block) {
            Ok(BlockDisposition::Orphaned) => {}
            Err(ChainError::Fork(_)) => {}
            other => panic!("fork below finality must not progress: {other:?}"),
        }
    }
    assert_eq!(node_a.chain.tip_hash(), tip);
    assert_eq!(node_a.chain.height(), 5);
    assert!(node_a.chain.is_finalized(BlockId::Height(5)));
}

#[test]
fn fork_at_finalized_height_is_allowed() {
    let (keys, validators) = validator_set(3, 10);
    let node_a = TestNode::with_validators(premine(), validators);
    let miner_a = addr(0xA0);
    let miner_b = addr(0xB0);
    for _ in 0..6 {
        node_a.mine(&miner_a);
    }

    let header = node_a.chain.get_header(5).unwrap();
    let hash = header.hash();
    for kp in &keys {
        node_a
            .chain
            .submit_finality_vote(&kp.address("TXAI"), BlockId::Height(5), &kp.sign(&hash))
            .unwrap();
    }

    // Fork point 5 keeps the finalized block; replacing height 6 is fine.
    let node_b = node_a.fork_from(5);
    let b6 = node_b.mine(&miner_b);
    let b7 = node_b.mine(&miner_b);
    node_a.chain.add_block(b6).unwrap();
    let disposition = node_a.chain.add_block(b7).unwrap();
    assert!(matches!(
        disposition,
        BlockDisposition::Reorged { fork_height: 5, .. }
    ));
    assert!(node_a.chain.is_finalized(BlockId::Height(5)));
}

#[test]
fn unknown_validator_vote_rejected() {
    let (_, validators) = validator_set(3, 10);
    let node = TestNode::with_validators(premine(), validators);
    node.mine(&addr(0xA0));

    let outsider = xai_core::crypto::KeyPair::generate();
    let hash = node.chain.get_header(1).unwrap().hash();
    let err = node
        .chain
        .submit_finality_vote(&outsider.address("TXAI"), BlockId::Height(1), &outsider.sign(&hash))
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Finality(FinalityError::UnknownValidator(_))
    ));
}

#[test]
fn vote_for_unknown_block_rejected() {
    let (keys, validators) = validator_set(3, 10);
    let node = TestNode::with_validators(premine(), validators);
    let err = node
        .chain
        .submit_finality_vote(
            &keys[0].address("TXAI"),
            BlockId::Height(99),
            &[0u8; 64],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ChainError::Finality(FinalityError::UnknownBlock(_))
    ));
}

#[test]
fn votes_without_validator_set_rejected() {
    let node = TestNode::with_premine(premine());
    node.mine(&addr(0xA0));
    let kp = xai_core::crypto::KeyPair::generate();
    let hash = node.chain.get_header(1).unwrap().hash();
    let err = node
        .chain
        .submit_finality_vote(&kp.address("TXAI"), BlockId::Height(1), &kp.sign(&hash))
        .unwrap_err();
    assert!(matches!(err, ChainError::Finality(_)));
    assert!(!node.chain.is_finalized(BlockId::Height(1)));
}

#[test]
fn finality_survives_restart() {
    let (keys, validators) = validator_set(3, 10);
    let node = TestNode::with_validators(premine(), validators);
    for _ in 0..3 {
        node.mine(&addr(0xA0));
    }
    let hash = node.chain.get_header(3).unwrap().hash();
    for kp in &keys {
        node.chain
            .submit_finality_vote(&kp.address("TXAI"), BlockId::Height(3), &kp.sign(&hash))
            .unwrap();
    }
    assert_eq!(node.chain.highest_finalized_height(), Some(3));

    let node = node.reopen();
    assert_eq!(node.chain.highest_finalized_height(), Some(3));
    assert!(node.chain.is_finalized(BlockId::Hash(hash)));
}
