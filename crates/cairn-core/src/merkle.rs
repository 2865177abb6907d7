//! BLAKE3 merkle trees for transaction and witness commitments.
//!
//! Uses domain-separated hashing to prevent second-preimage attacks:
//! - Leaf hash: `BLAKE3(0x00 || data)`
//! - Internal node: `BLAKE3(0x01 || left || right)`
//!
//! Odd-length layers are padded by duplicating the last element. Because of
//! that padding, a block whose transaction list repeats a trailing run has
//! the same root as the shorter list; [`merkle_root_mutated`] reports this so
//! such bodies can be rejected as malleated.

use crate::constants::WITNESS_COMMITMENT_HEADER;
use crate::types::{Block, Hash256};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Merkle root of `leaves`. Returns [`Hash256::ZERO`] for an empty slice.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    merkle_root_mutated(leaves).0
}

/// Merkle root plus a flag that is set when two real siblings at any level
/// are identical.
pub fn merkle_root_mutated(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return (Hash256::ZERO, false);
    }

    let mut mutated = false;
    let mut current: Vec<Hash256> = leaves.iter().map(leaf_hash).collect();
    while current.len() > 1 {
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for pair in current.chunks(2) {
            match pair {
                [left, right] => {
                    if left == right {
                        mutated = true;
                    }
                    next.push(node_hash(left, right));
                }
                [single] => next.push(node_hash(single, single)),
                _ => {}
            }
        }
        current = next;
    }
    (current[0], mutated)
}

/// Root over the block's txids and the mutation flag.
pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    merkle_root_mutated(&block.txids())
}

/// Root over the block's wtxids. The coinbase contributes the zero hash since
/// it carries the commitment itself.
pub fn block_witness_merkle_root(block: &Block) -> Hash256 {
    let leaves: Vec<Hash256> = block
        .transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| if i == 0 { Hash256::ZERO } else { tx.wtxid() })
        .collect();
    merkle_root(&leaves)
}

/// Coinbase output script committing to `witness_root`.
pub fn witness_commitment_script(witness_root: &Hash256) -> Vec<u8> {
    let mut script = Vec::with_capacity(4 + 32);
    script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    script.extend_from_slice(witness_root.as_bytes());
    script
}

/// Index of the last coinbase output that looks like a witness commitment.
pub fn witness_commitment_index(block: &Block) -> Option<usize> {
    let coinbase = block.coinbase()?;
    coinbase
        .outputs
        .iter()
        .rposition(|out| out.script_pubkey.len() == 36 && out.script_pubkey[..4] == WITNESS_COMMITMENT_HEADER)
}
