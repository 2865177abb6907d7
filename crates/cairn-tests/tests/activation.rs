//! Best-chain activation: ordering, tie-breaks, manual overrides, invalid
//! blocks and the fork warning.

use cairn_core::error::{BlockError, CairnError};
use cairn_tests::helpers::*;
use proptest::prelude::*;

// ------------------------------------------------------------------
// Linear growth
// ------------------------------------------------------------------

#[test]
fn linear_chain_activates_once() {
    let node = TestNode::new();
    let blocks = node.mine(5);

    let tip = node.tip();
    assert_eq!(tip.height, 5);
    assert_eq!(tip.hash, blocks[4].hash());
    assert!(tip.in_active_chain);

    // Re-running activation or resubmitting changes nothing.
    node.chain.activate_best_chain(None).unwrap();
    assert!(!node.chain.process_new_block(&blocks[2], true).unwrap());
    assert_eq!(node.tip().hash, blocks[4].hash());
    assert_eq!(node.chain.stats().blocks_connected, 5);
    assert_eq!(node.mempool.confirmed_heights(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn bodies_out_of_order_connect_when_gap_fills() {
    let node = TestNode::new();
    let blocks = node.branch(&genesis_hash(), 4, 0);
    for b in &blocks {
        node.chain.accept_header(&b.header).unwrap();
    }

    for b in blocks.iter().skip(1).rev() {
        assert!(node.chain.process_new_block(b, true).unwrap());
        assert_eq!(node.tip().height, 0);
    }
    node.chain.process_new_block(&blocks[0], true).unwrap();

    assert_eq!(node.tip().hash, blocks[3].hash());
    for (i, b) in blocks.iter().enumerate() {
        assert_eq!(node.chain.active_hash_at(i as u64 + 1), Some(b.hash()));
    }
}

#[test]
fn body_without_known_parent_is_missing_data() {
    let node = TestNode::new();
    let blocks = node.branch(&genesis_hash(), 2, 0);
    let err = node.chain.process_new_block(&blocks[1], true).unwrap_err();
    assert!(matches!(err, CairnError::Block(BlockError::PrevBlockNotFound(_))));
    assert!(!err.is_invalid() && !err.is_fatal());
}

#[test]
fn unrequested_block_without_more_work_is_skipped() {
    let node = TestNode::new();
    node.mine(2);
    let side = node.branch(&genesis_hash(), 1, 9);
    assert!(!node.chain.accept_block(&side[0], false, None).unwrap());
    assert!(!node.info(&side[0].hash()).has_data);
}

// ------------------------------------------------------------------
// Tie-breaks and precious
// ------------------------------------------------------------------

#[test]
fn equal_work_keeps_first_seen_tip() {
    let node = TestNode::new();
    let a = node.mine(2);
    let b = node.branch(&genesis_hash(), 3, 1);

    node.submit(&b[..2]);
    assert_eq!(node.tip().hash, a[1].hash());

    node.submit(&b[2..]);
    assert_eq!(node.tip().hash, b[2].hash());
    assert_eq!(node.chain.stats().blocks_disconnected, 2);
}

#[test]
fn precious_moves_between_equal_work_tips() {
    let node = TestNode::new();
    let a = node.mine(2);
    let b = node.branch(&genesis_hash(), 2, 1);
    node.submit(&b);
    assert_eq!(node.tip().hash, a[1].hash());

    assert!(node.chain.precious_block(&b[1].hash()).unwrap());
    assert_eq!(node.tip().hash, b[1].hash());

    // Each call within the same tip work ranks ahead of the previous one.
    assert!(node.chain.precious_block(&a[1].hash()).unwrap());
    assert_eq!(node.tip().hash, a[1].hash());

    // Less work than the tip: refused, nothing moves.
    assert!(!node.chain.precious_block(&a[0].hash()).unwrap());
    assert_eq!(node.tip().hash, a[1].hash());
}

#[test]
fn precious_counter_resets_after_tip_gains_work() {
    let node = TestNode::new();
    let a = node.mine(2);
    let b = node.branch(&genesis_hash(), 3, 1);
    node.submit(&b[..2]);
    assert!(node.chain.precious_block(&b[1].hash()).unwrap());
    assert!(node.chain.precious_block(&a[1].hash()).unwrap());

    let a3 = node.mine(1);
    node.submit(&b[2..]);
    assert_eq!(node.tip().hash, a3[0].hash());

    assert!(!node.chain.precious_block(&b[1].hash()).unwrap());
    assert!(node.chain.precious_block(&b[2].hash()).unwrap());
    assert_eq!(node.tip().hash, b[2].hash());
}

// ------------------------------------------------------------------
// Invalidate / reconsider
// ------------------------------------------------------------------

#[test]
fn invalidate_then_reconsider() {
    let node = TestNode::new();
    let a = node.mine(3);
    let b = node.branch(&genesis_hash(), 2, 1);
    node.submit(&b);
    assert_eq!(node.tip().hash, a[2].hash());

    node.chain.invalidate_block(&a[1].hash()).unwrap();
    assert_eq!(node.tip().hash, b[1].hash());
    assert!(node.info(&a[1].hash()).failed);
    assert!(node.info(&a[2].hash()).failed);
    assert!(!node.info(&a[0].hash()).failed);

    node.chain.reconsider_block(&a[1].hash()).unwrap();
    assert_eq!(node.tip().hash, a[2].hash());
    assert!(!node.info(&a[2].hash()).failed);
}

#[test]
fn genesis_cannot_be_invalidated() {
    let node = TestNode::new();
    node.mine(1);
    let err = node.chain.invalidate_block(&genesis_hash()).unwrap_err();
    assert!(err.is_invalid());
    assert_eq!(node.tip().height, 1);
}

// ------------------------------------------------------------------
// Invalid blocks
// ------------------------------------------------------------------

#[test]
fn block_failing_connect_is_marked_and_descendants_refused() {
    let node = TestNode::new();
    let a = node.mine(2);

    // Claims one unit more than the subsidy.
    let bad = node.block_on(&a[1].hash(), 0, Vec::new(), 1);
    assert!(node.chain.process_new_block(&bad, true).unwrap());
    assert_eq!(node.tip().hash, a[1].hash());
    assert!(node.info(&bad.hash()).failed);

    let child = node.block_on(&bad.hash(), 0, Vec::new(), 0);
    let err = node.chain.process_new_block(&child, true).unwrap_err();
    assert!(matches!(err, CairnError::Block(BlockError::BadPrevBlock)));

    let good = node.block_on(&a[1].hash(), 1, Vec::new(), 0);
    node.submit(&[good.clone()]);
    assert_eq!(node.tip().hash, good.hash());
}

#[test]
fn mutated_body_does_not_poison_header() {
    let node = TestNode::new();
    node.mine(1);
    let good = node.block_on(&node.tip().hash, 0, Vec::new(), 0);
    let mut mutated = good.clone();
    mutated.transactions[0].inputs[0].signature.push(0xff);
    assert_eq!(mutated.hash(), good.hash());

    let err = node.chain.process_new_block(&mutated, true).unwrap_err();
    assert!(matches!(err, CairnError::Block(BlockError::BadMerkleRoot)));
    assert!(!node.info(&good.hash()).failed);

    node.submit(&[good.clone()]);
    assert_eq!(node.tip().hash, good.hash());
}

#[test]
fn test_block_validity_leaves_state_alone() {
    let node = TestNode::new();
    node.mine(1);
    let tip = node.tip();

    let ok = node.block_on(&tip.hash, 0, Vec::new(), 0);
    node.chain.test_block_validity(&ok).unwrap();
    let bad = node.block_on(&tip.hash, 0, Vec::new(), 5);
    assert!(node.chain.test_block_validity(&bad).unwrap_err().is_invalid());

    assert_eq!(node.tip(), tip);
    assert!(node.chain.block_index_lookup(&ok.hash()).is_none());
}

// ------------------------------------------------------------------
// Locators
// ------------------------------------------------------------------

#[test]
fn fork_point_from_side_branch_locator() {
    let node = TestNode::new();
    let a = node.mine(6);
    let side = node.branch(&a[2].hash(), 2, 1);
    node.submit(&side);

    let locator: Vec<_> = side.iter().rev().map(|b| b.hash()).chain([a[2].hash()]).collect();
    assert_eq!(node.chain.find_fork_point(&locator).hash, a[2].hash());

    let own = node.chain.block_locator();
    assert_eq!(own.first(), Some(&a[5].hash()));
    assert_eq!(own.last(), Some(&genesis_hash()));
}

// ------------------------------------------------------------------
// Fork warning
// ------------------------------------------------------------------

#[test]
fn fork_warning_raised_for_heavier_unconnected_branch() {
    let node = TestNode::new();
    let a = node.mine(10);
    assert!(node.chain.warnings().is_empty());

    let b = node.branch(&a[7].hash(), 12, 1);
    for blk in &b {
        node.chain.accept_header(&blk.header).unwrap();
    }
    node.mine(1);
    let warnings = node.chain.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("fork"));

    node.submit(&b);
    assert_eq!(node.tip().hash, b[11].hash());
    assert!(node.chain.warnings().is_empty());
}

#[test]
fn headers_ahead_of_bodies_are_not_a_fork() {
    let node = TestNode::new();
    node.mine(10);
    let ahead = node.branch(&node.tip().hash, 9, 0);
    for blk in &ahead {
        node.chain.accept_header(&blk.header).unwrap();
    }
    node.submit(&ahead[..1]);

    assert_eq!(node.tip().hash, ahead[0].hash());
    assert!(node.chain.warnings().is_empty());
}

#[test]
fn side_fork_still_warns_while_headers_extend_tip() {
    let node = TestNode::new();
    let a = node.mine(10);
    let fork = node.branch(&a[7].hash(), 12, 1);
    let ahead = node.branch(&a[9].hash(), 20, 0);
    for blk in fork.iter().chain(&ahead) {
        node.chain.accept_header(&blk.header).unwrap();
    }
    node.submit(&ahead[..1]);

    let warnings = node.chain.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains(&fork[11].hash().to_string()));
}

#[test]
fn small_lead_does_not_warn() {
    let node = TestNode::new();
    let a = node.mine(4);
    let b = node.branch(&a[2].hash(), 5, 1);
    for blk in &b {
        node.chain.accept_header(&blk.header).unwrap();
    }
    node.mine(1);
    assert!(node.chain.warnings().is_empty());
}

// ------------------------------------------------------------------
// Arrival order
// ------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn any_body_order_reaches_same_tip(order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()) {
        let node = TestNode::new();
        let blocks = node.branch(&genesis_hash(), 5, 0);
        for b in &blocks {
            node.chain.accept_header(&b.header).unwrap();
        }
        for i in order {
            node.chain.process_new_block(&blocks[i], true).unwrap();
        }
        prop_assert_eq!(node.tip().hash, blocks[4].hash());
        prop_assert_eq!(node.chain.stats().blocks_disconnected, 0);
    }
}
