//! End-to-end scenarios: transfers, double spends, replace-by-fee, queries.

use xai_core::constants::COIN;
use xai_core::crypto::KeyPair;
use xai_core::error::{ChainError, MempoolError, TransactionError};
use xai_core::types::{OutPoint, TxOutput};
use xai_node::chain::{BlockDisposition, BlockId};

use xai_tests::helpers::{addr, funded_node, manual_transfer};

#[test]
fn single_transfer_end_to_end() {
    let (node, alice) = funded_node(100 * COIN);
    let alice_addr = alice.address("TXAI");
    let bob = addr(0xB0);
    let miner = addr(0xC0);

    assert_eq!(node.chain.get_balance(&alice_addr), 100 * COIN);

    // Alice sends 40 with fee 1.
    node.chain
        .send(&alice, bob.clone(), 40 * COIN, COIN)
        .unwrap();
    assert_eq!(node.chain.get_stats().mempool_size, 1);

    let block = node.mine(&miner);

    // Coinbase pays subsidy plus the collected fee.
    assert_eq!(
        block.transactions[0].total_output_value().unwrap(),
        node.chain.config().initial_block_reward + COIN
    );
    assert_eq!(block.transactions.len(), 2);

    // Alice's funding UTXO is consumed; change and payment exist.
    assert_eq!(node.chain.get_balance(&alice_addr), 59 * COIN);
    assert_eq!(node.chain.get_balance(&bob), 40 * COIN);
    assert_eq!(
        node.chain.get_balance(&miner),
        node.chain.config().initial_block_reward + COIN
    );
    assert_eq!(node.chain.get_stats().mempool_size, 0);
}

#[test]
fn double_spend_rejected_and_never_readmissible() {
    let (node, alice) = funded_node(100 * COIN);
    let bob = addr(0xB0);
    let carol = addr(0xB1);

    let t1 = node
        .chain
        .create_transaction(&alice, bob, 40 * COIN, COIN, false)
        .unwrap();
    node.chain.submit_transaction(t1.clone()).unwrap();

    // T2 spends the same UTXO with a valid follow-up nonce.
    let t2 = manual_transfer(
        &alice,
        vec![(t1.inputs[0].clone(), 100 * COIN)],
        carol,
        40 * COIN,
        COIN,
        1,
        node.clock.now(),
    );
    let err = node.chain.submit_transaction(t2.clone()).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Mempool(MempoolError::Conflict { .. })
    ));

    // After T1 confirms, T2's input no longer exists at all.
    node.mine(&addr(0xC0));
    let err = node.chain.submit_transaction(t2).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Transaction(TransactionError::UnknownUtxo(_))
    ));
    // Mining again never includes it.
    let block = node.mine(&addr(0xC0));
    assert_eq!(block.transactions.len(), 1);
}

#[test]
fn replace_by_fee_swaps_mempool_entry() {
    let (node, alice) = funded_node(100 * COIN);
    let bob = addr(0xB0);

    let t1 = node
        .chain
        .create_transaction(&alice, bob.clone(), 40 * COIN, COIN, true)
        .unwrap();
    let t1_id = node.chain.submit_transaction(t1.clone()).unwrap();

    // T2: same inputs and nonce, higher fee, names T1.
    let fee2 = 3 * COIN;
    let mut t2 = manual_transfer(
        &alice,
        vec![(t1.inputs[0].clone(), 100 * COIN)],
        bob.clone(),
        40 * COIN,
        fee2,
        t1.nonce,
        node.clock.now(),
    );
    t2.replaces_txid = Some(t1_id);
    xai_core::crypto::sign_transaction(&mut t2, &alice);

    let t2_id = node.chain.submit_transaction(t2).unwrap();
    assert_ne!(t1_id, t2_id);
    assert_eq!(node.chain.get_stats().mempool_size, 1);

    // The mined block contains T2 only.
    let block = node.mine(&addr(0xC0));
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(block.transactions[1].txid(), t2_id);
    assert_eq!(node.chain.get_balance(&bob), 40 * COIN);
    assert_eq!(
        node.chain.get_balance(&alice.address("TXAI")),
        100 * COIN - 40 * COIN - fee2
    );
}

#[test]
fn duplicate_block_is_already_have() {
    let (node, _alice) = funded_node(100 * COIN);
    let block = node.mine(&addr(0xC0));
    assert_eq!(
        node.chain.add_block(block).unwrap(),
        BlockDisposition::AlreadyHave
    );
}

#[test]
fn empty_mempool_template_is_coinbase_only() {
    let (node, _alice) = funded_node(100 * COIN);
    let template = node.chain.build_block_template(&addr(0xC0)).unwrap();
    assert_eq!(template.transactions.len(), 1);
    assert!(template.transactions[0].is_coinbase());
}

#[test]
fn chained_spend_waits_for_parent_confirmation() {
    let (node, alice) = funded_node(100 * COIN);
    let bob = KeyPair::generate();
    let bob_addr = bob.address("TXAI");
    let carol = addr(0xB1);

    // Parent: Alice pays Bob 50.
    let parent = node
        .chain
        .create_transaction(&alice, bob_addr.clone(), 50 * COIN, COIN, false)
        .unwrap();
    let parent_id = node.chain.submit_transaction(parent).unwrap();

    // Child: Bob immediately spends the pending output. Rejected (held as
    // an orphan) because the parent is unconfirmed.
    let child = manual_transfer(
        &bob,
        vec![(OutPoint { txid: parent_id, vout: 0 }, 50 * COIN)],
        carol.clone(),
        10 * COIN,
        COIN,
        0,
        node.clock.now(),
    );
    let err = node.chain.submit_transaction(child).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Transaction(TransactionError::UnknownUtxo(_))
    ));

    // Once the parent confirms, the held child is admitted automatically.
    node.mine(&addr(0xC0));
    assert_eq!(node.chain.get_stats().mempool_size, 1);
    node.mine(&addr(0xC0));
    assert_eq!(node.chain.get_balance(&carol), 10 * COIN);
}

#[test]
fn nonce_gap_is_rejected() {
    let (node, alice) = funded_node(100 * COIN);
    let premine_txid = node.chain.get_block(0).unwrap().unwrap().transactions[0].txid();
    let tx = manual_transfer(
        &alice,
        vec![(OutPoint { txid: premine_txid, vout: 0 }, 100 * COIN)],
        addr(0xB0),
        COIN,
        COIN,
        5, // expected 0
        node.clock.now(),
    );
    let err = node.chain.submit_transaction(tx).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Transaction(TransactionError::NonceMismatch { expected: 0, got: 5, .. })
    ));
}

#[test]
fn transaction_history_tracks_both_parties() {
    let (node, alice) = funded_node(100 * COIN);
    let alice_addr = alice.address("TXAI");
    let bob = addr(0xB0);

    node.chain.send(&alice, bob.clone(), 40 * COIN, COIN).unwrap();
    node.mine(&addr(0xC0));

    let alice_history = node.chain.get_transaction_history(&alice_addr, 10, 0).unwrap();
    // Genesis premine credit + the spend.
    assert_eq!(alice_history.len(), 2);
    assert!(!alice_history[0].is_sender);
    assert!(alice_history[1].is_sender);
    assert_eq!(alice_history[1].amount, 41 * COIN); // amount + fee
    assert_eq!(alice_history[1].height, 1);

    let bob_history = node.chain.get_transaction_history(&bob, 10, 0).unwrap();
    assert_eq!(bob_history.len(), 1);
    assert_eq!(bob_history[0].amount, 40 * COIN);
}

#[test]
fn stats_and_snapshot_reflect_chain() {
    let (node, alice) = funded_node(100 * COIN);
    node.chain.send(&alice, addr(0xB0), COIN, COIN).unwrap();
    node.mine(&addr(0xC0));

    let stats = node.chain.get_stats();
    assert_eq!(stats.height, 1);
    assert_eq!(stats.mempool_size, 0);
    assert_eq!(stats.difficulty, 0);
    // Premine plus one subsidy plus the fee recycled to the miner.
    assert_eq!(
        stats.supply,
        100 * COIN + node.chain.config().initial_block_reward + COIN
    );
    assert_eq!(stats.finalized_height, None);

    let snapshot = node.chain.get_state_snapshot();
    assert_eq!(snapshot.height, 1);
    assert_eq!(snapshot.tip, node.chain.tip_hash());
    assert_eq!(snapshot.pending_count, 0);
}

#[test]
fn restart_preserves_chain_and_balances() {
    let (node, alice) = funded_node(100 * COIN);
    let bob = addr(0xB0);
    node.chain.send(&alice, bob.clone(), 40 * COIN, COIN).unwrap();
    node.mine(&addr(0xC0));
    let tip = node.chain.tip_hash();

    let node = node.reopen();
    assert_eq!(node.chain.height(), 1);
    assert_eq!(node.chain.tip_hash(), tip);
    assert_eq!(node.chain.get_balance(&bob), 40 * COIN);
    assert_eq!(node.chain.get_balance(&alice.address("TXAI")), 59 * COIN);
}

#[test]
fn mempool_survives_restart() {
    let (node, alice) = funded_node(100 * COIN);
    node.chain.send(&alice, addr(0xB0), 40 * COIN, COIN).unwrap();
    assert_eq!(node.chain.get_stats().mempool_size, 1);

    let node = node.reopen();
    assert_eq!(node.chain.get_stats().mempool_size, 1);
    // The reloaded transaction still mines.
    node.mine(&addr(0xC0));
    assert_eq!(node.chain.get_balance(&addr(0xB0)), 40 * COIN);
}

#[test]
fn block_queries_by_height_and_hash() {
    let (node, _alice) = funded_node(100 * COIN);
    let block = node.mine(&addr(0xC0));
    let hash = block.header.hash();

    assert_eq!(node.chain.get_block(1).unwrap(), Some(block.clone()));
    assert_eq!(node.chain.get_block_by_hash(&hash).unwrap(), Some(block));
    assert_eq!(node.chain.get_block(9).unwrap(), None);
    assert!(!node.chain.is_finalized(BlockId::Height(1)));
}

#[test]
fn faucet_mints_on_testnet() {
    let (node, _alice) = funded_node(100 * COIN);
    let lucky = addr(0x77);
    let config = node.chain.config().clone();

    let faucet = xai_core::types::Transaction {
        sender: xai_core::address::Address::coinbase(),
        recipient: lucky.clone(),
        amount: config.faucet_amount,
        fee: 0,
        public_key: vec![],
        nonce: 0,
        tx_type: xai_core::types::TxType::Faucet,
        timestamp: node.clock.now(),
        inputs: vec![],
        outputs: vec![TxOutput { address: lucky.clone(), amount: config.faucet_amount }],
        signature: None,
        rbf_enabled: false,
        replaces_txid: None,
    };
    node.chain.submit_transaction(faucet).unwrap();
    node.mine(&addr(0xC0));
    assert_eq!(node.chain.get_balance(&lucky), config.faucet_amount);
}
