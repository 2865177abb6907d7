//! Genesis blocks.
//!
//! Every network has a hard-coded, deterministic genesis block at height 0.
//! Its coinbase output is never added to the coin set.

use std::sync::LazyLock;

use crate::constants::{ChainParams, NetworkType, INITIAL_SUBSIDY, SEQUENCE_FINAL};
use crate::difficulty::hash_meets_target;
use crate::merkle;
use crate::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Genesis timestamp: January 1, 2026 00:00:00 UTC.
pub const GENESIS_TIMESTAMP: u64 = 1_767_225_600;

/// Message embedded in the genesis coinbase.
pub const GENESIS_MESSAGE: &[u8] = b"Stones stacked one on another mark the way.";

static MAINNET: LazyLock<Block> = LazyLock::new(|| build_genesis(NetworkType::Mainnet));
static TESTNET: LazyLock<Block> = LazyLock::new(|| build_genesis(NetworkType::Testnet));
static REGTEST: LazyLock<Block> = LazyLock::new(|| build_genesis(NetworkType::Regtest));

fn build_genesis(network: NetworkType) -> Block {
    let params = ChainParams::for_network(network);
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: GENESIS_MESSAGE.to_vec(),
            public_key: vec![],
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOutput {
            value: INITIAL_SUBSIDY,
            script_pubkey: blake3::hash(b"cairn genesis").as_bytes().to_vec(),
        }],
        lock_time: 0,
    };

    let mut header = BlockHeader {
        version: 1,
        prev_hash: Hash256::ZERO,
        merkle_root: merkle::merkle_root(&[coinbase.txid()]),
        timestamp: GENESIS_TIMESTAMP,
        difficulty_target: params.pow_limit,
        nonce: 0,
    };
    while !hash_meets_target(&header.hash(), header.difficulty_target) {
        header.nonce += 1;
    }

    Block {
        header,
        transactions: vec![coinbase],
    }
}

/// The genesis block of `network`.
pub fn genesis_block(network: NetworkType) -> &'static Block {
    match network {
        NetworkType::Mainnet => &MAINNET,
        NetworkType::Testnet => &TESTNET,
        NetworkType::Regtest => &REGTEST,
    }
}
