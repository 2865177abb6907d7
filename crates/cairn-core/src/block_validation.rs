//! Block validation rules.
//!
//! Four levels of validation:
//!
//! - **Header** ([`check_block_header`]): proof of work against the claimed
//!   target.
//! - **Body** ([`check_block`]): context-free checks on merkle root,
//!   coinbase position, weight and transaction structure.
//! - **Contextual header** ([`contextual_check_block_header`]): timestamp,
//!   version and difficulty relative to the parent.
//! - **Contextual body** ([`contextual_check_block`]): lock-time finality,
//!   BIP34 coinbase height and the witness commitment.
//!
//! Coin-dependent rules (BIP30, input existence, fees, scripts) are applied
//! while connecting the block to the chain.

use crate::constants::{
    ChainParams, MAX_BLOCK_WEIGHT, MAX_FUTURE_BLOCK_TIME, MEDIAN_TIME_SPAN, WITNESS_SCALE_FACTOR,
};
use crate::difficulty::hash_meets_target;
use crate::error::BlockError;
use crate::merkle;
use crate::types::{Block, BlockHeader};
use crate::validation;

/// What a header is checked against: facts about its parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderContext {
    /// Height of the header being validated.
    pub height: u64,
    /// Median timestamp of the last [`MEDIAN_TIME_SPAN`] ancestors.
    pub median_time_past: u64,
    /// Target required by retargeting at this height.
    pub expected_target: u64,
}

/// Median of up to [`MEDIAN_TIME_SPAN`] timestamps.
pub fn median_time(timestamps: &[u64]) -> u64 {
    let start = timestamps.len().saturating_sub(MEDIAN_TIME_SPAN);
    let mut window: Vec<u64> = timestamps[start..].to_vec();
    if window.is_empty() {
        return 0;
    }
    window.sort_unstable();
    window[window.len() / 2]
}

/// Check the header's proof of work against its own target.
pub fn check_block_header(header: &BlockHeader, pow_limit: u64) -> Result<(), BlockError> {
    if header.difficulty_target > pow_limit {
        return Err(BlockError::TargetTooEasy);
    }
    if !hash_meets_target(&header.hash(), header.difficulty_target) {
        return Err(BlockError::HighHash);
    }
    Ok(())
}

/// Context-free body checks.
///
/// - Header proof of work
/// - Merkle root matches, with no duplicated subtree
/// - At least one transaction; first and only first is coinbase
/// - Stripped size and weight within [`MAX_BLOCK_WEIGHT`]
/// - Every transaction passes [`validation::check_transaction`]
pub fn check_block(block: &Block, pow_limit: u64) -> Result<(), BlockError> {
    check_block_header(&block.header, pow_limit)?;

    let (root, mutated) = merkle::block_merkle_root(block);
    if root != block.header.merkle_root {
        return Err(BlockError::BadMerkleRoot);
    }
    if mutated {
        return Err(BlockError::DuplicateTransaction);
    }

    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }
    if block.stripped_size() * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
        return Err(BlockError::Overweight {
            weight: block.stripped_size() * WITNESS_SCALE_FACTOR,
            max: MAX_BLOCK_WEIGHT,
        });
    }

    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err(BlockError::MultipleCoinbase);
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        validation::check_transaction(tx)
            .map_err(|source| BlockError::Transaction { index, source })?;
    }

    Ok(())
}

/// Header checks that depend on the parent chain.
pub fn contextual_check_block_header(
    header: &BlockHeader,
    ctx: &HeaderContext,
    params: &ChainParams,
    now: u64,
) -> Result<(), BlockError> {
    if params.pow_no_retargeting {
        if header.difficulty_target > params.pow_limit {
            return Err(BlockError::TargetTooEasy);
        }
    } else if header.difficulty_target != ctx.expected_target {
        return Err(BlockError::BadDifficulty {
            got: header.difficulty_target,
            expected: ctx.expected_target,
        });
    }

    if header.timestamp <= ctx.median_time_past {
        return Err(BlockError::TimeTooOld);
    }
    if header.timestamp > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
        return Err(BlockError::TimeTooNew(header.timestamp));
    }

    if header.version < params.min_block_version(ctx.height) {
        return Err(BlockError::BadVersion {
            version: header.version,
            height: ctx.height,
        });
    }

    Ok(())
}

/// Body checks that depend on the block's height and its parent's
/// median time past.
pub fn contextual_check_block(
    block: &Block,
    height: u64,
    parent_median_time: u64,
    params: &ChainParams,
) -> Result<(), BlockError> {
    let lock_time_cutoff = if height >= params.csv_height {
        parent_median_time
    } else {
        block.header.timestamp
    };
    for (index, tx) in block.transactions.iter().enumerate() {
        if !validation::is_final_tx(tx, height, lock_time_cutoff) {
            return Err(BlockError::Transaction {
                index,
                source: crate::error::TransactionError::NonFinal,
            });
        }
    }

    if height >= params.bip34_height {
        let expected = height.to_le_bytes();
        let coinbase = block.coinbase().ok_or(BlockError::NoCoinbase)?;
        if !coinbase.inputs[0].signature.starts_with(&expected) {
            return Err(BlockError::BadCoinbaseHeight);
        }
    }

    if height >= params.segwit_height {
        check_witness_commitment(block)?;
    }

    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(BlockError::Overweight {
            weight: block.weight(),
            max: MAX_BLOCK_WEIGHT,
        });
    }

    Ok(())
}

/// A block carrying witness data must commit to it from the coinbase.
fn check_witness_commitment(block: &Block) -> Result<(), BlockError> {
    let has_witness = block.transactions.iter().any(|tx| tx.has_witness());
    match merkle::witness_commitment_index(block) {
        Some(idx) => {
            let expected = merkle::witness_commitment_script(&merkle::block_witness_merkle_root(block));
            let coinbase = block.coinbase().ok_or(BlockError::NoCoinbase)?;
            if coinbase.outputs[idx].script_pubkey != expected {
                return Err(BlockError::BadWitnessCommitment);
            }
            Ok(())
        }
        None if has_witness => Err(BlockError::MissingWitnessCommitment),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{NetworkType, COIN, SEQUENCE_FINAL};
    use crate::types::{Hash256, OutPoint, Transaction, TxInput, TxOutput};

    fn params() -> ChainParams {
        ChainParams::for_network(NetworkType::Regtest)
    }

    fn coinbase(height: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: height.to_le_bytes().to_vec(),
                public_key: vec![],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOutput {
                value: 50 * COIN,
                script_pubkey: vec![0xAA; 32],
            }],
            lock_time: 0,
        }
    }

    fn spend() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(Hash256([9; 32]), 0),
                signature: vec![1; 64],
                public_key: vec![2; 32],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOutput {
                value: COIN,
                script_pubkey: vec![0xBB; 32],
            }],
            lock_time: 0,
        }
    }

    fn block(txs: Vec<Transaction>) -> Block {
        let mut b = Block {
            header: BlockHeader {
                version: 4,
                prev_hash: Hash256([1; 32]),
                merkle_root: Hash256::ZERO,
                timestamp: 1_800_000_000,
                difficulty_target: u64::MAX,
                nonce: 0,
            },
            transactions: txs,
        };
        b.header.merkle_root = merkle::block_merkle_root(&b).0;
        b
    }

    fn commit(mut b: Block) -> Block {
        let root = merkle::block_witness_merkle_root(&b);
        b.transactions[0].outputs.push(TxOutput {
            value: 0,
            script_pubkey: merkle::witness_commitment_script(&root),
        });
        b.header.merkle_root = merkle::block_merkle_root(&b).0;
        b
    }

    // --- check_block_header ---

    #[test]
    fn target_above_limit_rejected() {
        let b = block(vec![coinbase(1)]);
        assert_eq!(check_block_header(&b.header, u64::MAX - 1), Err(BlockError::TargetTooEasy));
    }

    #[test]
    fn hard_target_rejects_unmined_header() {
        let mut b = block(vec![coinbase(1)]);
        b.header.difficulty_target = 0;
        let result = check_block_header(&b.header, u64::MAX);
        assert!(result == Err(BlockError::HighHash) || b.header.hash().0[..8] == [0; 8]);
    }

    // --- check_block ---

    #[test]
    fn valid_block_passes() {
        assert_eq!(check_block(&block(vec![coinbase(1), spend()]), u64::MAX), Ok(()));
    }

    #[test]
    fn bad_merkle_root() {
        let mut b = block(vec![coinbase(1)]);
        b.header.merkle_root = Hash256([7; 32]);
        assert_eq!(check_block(&b, u64::MAX), Err(BlockError::BadMerkleRoot));
    }

    #[test]
    fn duplicated_tail_is_mutation() {
        let b = block(vec![coinbase(1), spend(), spend()]);
        let err = check_block(&b, u64::MAX).unwrap_err();
        assert_eq!(err, BlockError::DuplicateTransaction);
        assert!(err.is_mutation());
    }

    #[test]
    fn coinbase_must_be_first() {
        let b = block(vec![spend(), coinbase(1)]);
        assert_eq!(check_block(&b, u64::MAX), Err(BlockError::FirstTxNotCoinbase));
    }

    #[test]
    fn second_coinbase_rejected() {
        let b = block(vec![coinbase(1), coinbase(2)]);
        assert_eq!(check_block(&b, u64::MAX), Err(BlockError::MultipleCoinbase));
    }

    #[test]
    fn empty_block_rejected() {
        let b = block(vec![]);
        assert_eq!(check_block(&b, u64::MAX), Err(BlockError::NoCoinbase));
    }

    // --- contextual_check_block_header ---

    #[test]
    fn time_must_exceed_median() {
        let b = block(vec![coinbase(1)]);
        let ctx = HeaderContext {
            height: 1,
            median_time_past: b.header.timestamp,
            expected_target: u64::MAX,
        };
        assert_eq!(
            contextual_check_block_header(&b.header, &ctx, &params(), b.header.timestamp),
            Err(BlockError::TimeTooOld)
        );
    }

    #[test]
    fn future_time_rejected() {
        let b = block(vec![coinbase(1)]);
        let ctx = HeaderContext {
            height: 1,
            median_time_past: 0,
            expected_target: u64::MAX,
        };
        let now = b.header.timestamp - MAX_FUTURE_BLOCK_TIME - 1;
        assert!(matches!(
            contextual_check_block_header(&b.header, &ctx, &params(), now),
            Err(BlockError::TimeTooNew(_))
        ));
    }

    #[test]
    fn old_version_rejected_after_activation() {
        let mut b = block(vec![coinbase(1)]);
        b.header.version = 1;
        let ctx = HeaderContext {
            height: 5,
            median_time_past: 0,
            expected_target: u64::MAX,
        };
        assert_eq!(
            contextual_check_block_header(&b.header, &ctx, &params(), b.header.timestamp),
            Err(BlockError::BadVersion { version: 1, height: 5 })
        );
    }

    #[test]
    fn retargeting_network_requires_exact_target() {
        let mut p = ChainParams::for_network(NetworkType::Mainnet);
        p.pow_limit = u64::MAX;
        let b = block(vec![coinbase(1)]);
        let ctx = HeaderContext {
            height: 1,
            median_time_past: 0,
            expected_target: 5,
        };
        assert_eq!(
            contextual_check_block_header(&b.header, &ctx, &p, b.header.timestamp),
            Err(BlockError::BadDifficulty { got: u64::MAX, expected: 5 })
        );
    }

    // --- contextual_check_block ---

    #[test]
    fn coinbase_height_enforced() {
        let b = block(vec![coinbase(7)]);
        assert_eq!(
            contextual_check_block(&b, 8, 0, &params()),
            Err(BlockError::BadCoinbaseHeight)
        );
        assert_eq!(contextual_check_block(&b, 7, 0, &params()), Ok(()));
    }

    #[test]
    fn witness_requires_commitment() {
        let b = block(vec![coinbase(3), spend()]);
        assert_eq!(
            contextual_check_block(&b, 3, 0, &params()),
            Err(BlockError::MissingWitnessCommitment)
        );
        let committed = commit(block(vec![coinbase(3), spend()]));
        assert_eq!(contextual_check_block(&committed, 3, 0, &params()), Ok(()));
    }

    #[test]
    fn tampered_witness_breaks_commitment() {
        let mut b = commit(block(vec![coinbase(3), spend()]));
        b.transactions[1].inputs[0].signature = vec![9; 64];
        assert_eq!(
            contextual_check_block(&b, 3, 0, &params()),
            Err(BlockError::BadWitnessCommitment)
        );
    }

    #[test]
    fn non_final_tx_rejected() {
        let mut s = spend();
        s.lock_time = 50;
        s.inputs[0].sequence = 0;
        let b = commit(block(vec![coinbase(3), s]));
        assert!(matches!(
            contextual_check_block(&b, 3, 0, &params()),
            Err(BlockError::Transaction { index: 1, .. })
        ));
    }

    #[test]
    fn median_of_window() {
        assert_eq!(median_time(&[]), 0);
        assert_eq!(median_time(&[5, 1, 3]), 3);
        let ts: Vec<u64> = (0..20).collect();
        assert_eq!(median_time(&ts), 14);
    }
}
