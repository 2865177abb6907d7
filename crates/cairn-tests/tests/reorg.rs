//! Reorganizations: coin restoration, mempool reconciliation, long
//! reorgs spanning several connect batches.

use cairn_core::constants::COINBASE_MATURITY;
use cairn_core::crypto::KeyPair;
use cairn_core::difficulty::hash_meets_target;
use cairn_core::types::OutPoint;
use cairn_tests::helpers::*;

#[test]
fn reorg_restores_spent_coin_and_returns_tx_to_mempool() {
    let node = TestNode::new();
    let mined = node.mine(COINBASE_MATURITY as usize + 2);
    let fork_base = node.tip();

    let spent_op = coinbase_outpoint(&mined[0]);
    let coin = node.chain.coin(&spent_op).unwrap().expect("mature coinbase");
    assert_eq!(coin.height, 1);

    let recipient = KeyPair::from_secret_bytes([9; 32]);
    let tx = spend(&spent_op, &coin, &recipient, 1_000);
    let txid = tx.txid();
    let with_spend = node.block_on(&fork_base.hash, 0, vec![tx.clone()], 1_000);
    node.submit(&[with_spend.clone()]);

    assert_eq!(node.tip().hash, with_spend.hash());
    assert!(node.chain.coin(&spent_op).unwrap().is_none());
    let created = OutPoint::new(txid, 0);
    assert_eq!(
        node.chain.coin(&created).unwrap().map(|c| c.output.value),
        Some(coin.output.value - 1_000)
    );
    assert_eq!(node.chain.get_transaction(&txid).unwrap(), Some(tx));

    // A heavier branch without the spend takes over.
    let other = node.branch(&fork_base.hash, 2, 1);
    node.submit(&other);
    assert_eq!(node.tip().hash, other[1].hash());

    let restored = node.chain.coin(&spent_op).unwrap().expect("coin restored");
    assert_eq!(restored, coin);
    assert!(node.chain.coin(&created).unwrap().is_none());

    let reorgs = node.mempool.reorgs();
    let (txids, add_back) = reorgs.last().expect("mempool told about the reorg");
    assert_eq!(txids, &vec![txid]);
    assert!(*add_back);

    assert!(node.info(&with_spend.hash()).validity >= cairn_node_lib::Validity::Scripts);
    assert_eq!(node.chain.verify_recent_blocks(10).unwrap(), 10);
}

#[test]
fn double_spend_on_competing_branch_is_fine_after_reorg() {
    let node = TestNode::new();
    let mined = node.mine(COINBASE_MATURITY as usize + 2);
    let base = node.tip();
    let op = coinbase_outpoint(&mined[1]);
    let coin = node.chain.coin(&op).unwrap().unwrap();

    let to_a = spend(&op, &coin, &KeyPair::from_secret_bytes([1; 32]), 10);
    let to_b = spend(&op, &coin, &KeyPair::from_secret_bytes([2; 32]), 20);
    assert_ne!(to_a.txid(), to_b.txid());

    let a = node.block_on(&base.hash, 0, vec![to_a.clone()], 10);
    node.submit(&[a.clone()]);
    let b1 = node.block_on(&base.hash, 1, vec![to_b.clone()], 20);
    node.submit(&[b1.clone()]);
    assert_eq!(node.tip().hash, a.hash());

    let b2 = node.block_on(&b1.hash(), 1, Vec::new(), 0);
    node.submit(&[b2.clone()]);
    assert_eq!(node.tip().hash, b2.hash());
    assert!(node.chain.coin(&OutPoint::new(to_a.txid(), 0)).unwrap().is_none());
    assert!(node.chain.coin(&OutPoint::new(to_b.txid(), 0)).unwrap().is_some());
    assert!(node.chain.coin(&op).unwrap().is_none());
}

#[test]
fn long_reorg_spans_connect_batches() {
    let node = TestNode::new();
    let a = node.mine(40);
    let b = node.branch(&genesis_hash(), 41, 1);

    node.submit(&b[..40]);
    assert_eq!(node.tip().hash, a[39].hash());

    node.submit(&b[40..]);
    assert_eq!(node.tip().hash, b[40].hash());
    for (i, blk) in b.iter().enumerate() {
        assert_eq!(node.chain.active_hash_at(i as u64 + 1), Some(blk.hash()));
    }
    let stats = node.chain.stats();
    assert_eq!(stats.blocks_disconnected, 40);
    assert_eq!(stats.blocks_connected, 40 + 41);

    for blk in &a {
        assert!(!node.info(&blk.hash()).in_active_chain);
        assert!(node.chain.coin(&coinbase_outpoint(blk)).unwrap().is_none());
    }
    assert!(node.chain.coin(&coinbase_outpoint(&b[20])).unwrap().is_some());
}

#[test]
fn heavier_single_block_replaces_tip_and_second_activation_is_a_noop() {
    let node = TestNode::new();
    let a = node.mine(1);
    assert_eq!(node.tip().height, 1);

    // Same height, four times the work per block.
    let mut b = node.block_on(&genesis_hash(), 1, Vec::new(), 0);
    b.header.difficulty_target = u64::MAX / 4;
    while !hash_meets_target(&b.hash(), b.header.difficulty_target) {
        b.header.nonce += 1;
    }

    assert!(node.chain.accept_block(&b, true, None).unwrap());
    assert_eq!(node.tip().hash, a[0].hash());
    assert_eq!(node.chain.best_candidate().map(|c| c.hash), Some(b.hash()));

    node.chain.activate_best_chain(None).unwrap();
    assert_eq!(node.tip().hash, b.hash());
    assert!(node.chain.coin(&coinbase_outpoint(&a[0])).unwrap().is_none());
    assert!(node.chain.coin(&coinbase_outpoint(&b)).unwrap().is_some());
    assert!(!node.info(&a[0].hash()).in_active_chain);

    let before = node.chain.stats();
    assert_eq!(before.blocks_disconnected, 1);
    assert_eq!(before.blocks_connected, 2);
    node.chain.activate_best_chain(None).unwrap();
    let after = node.chain.stats();
    assert_eq!(after.blocks_connected, before.blocks_connected);
    assert_eq!(after.blocks_disconnected, before.blocks_disconnected);
    assert_eq!(node.tip().hash, b.hash());
}
