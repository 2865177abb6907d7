//! Shared test helpers: node setup, block and transaction builders.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use cairn_consensus::{Ed25519Verifier, SignedCheckpoint};
use cairn_core::constants::{
    ChainParams, NetworkType, REGTEST_CHECKPOINT_SECRET, SEQUENCE_FINAL,
};
use cairn_core::crypto::{sign_transaction_input, KeyPair};
use cairn_core::genesis::{genesis_block, GENESIS_TIMESTAMP};
use cairn_core::merkle;
use cairn_core::reward::block_subsidy;
use cairn_core::traits::{FixedClock, MempoolSink};
use cairn_core::types::*;
use cairn_node_lib::{BlockInfo, Chainstate, ChainstateConfig, Collaborators, FlushMode};

/// Seconds between consecutive test blocks.
pub const BLOCK_SPACING: u64 = 60;

/// Clock value every test node starts with: late enough that a fresh
/// regtest chain is out of initial block download, early enough that a few
/// hundred test blocks are not too far in the future.
pub const TEST_NOW: u64 = GENESIS_TIMESTAMP + 20_000;

pub fn regtest() -> ChainParams {
    ChainParams::for_network(NetworkType::Regtest)
}

/// Key that receives every test coinbase.
pub fn miner() -> KeyPair {
    KeyPair::from_secret_bytes([7; 32])
}

pub fn checkpoint_key() -> KeyPair {
    KeyPair::from_secret_bytes(REGTEST_CHECKPOINT_SECRET)
}

pub fn sign_checkpoint(height: u64, hash: Hash256) -> SignedCheckpoint {
    SignedCheckpoint::sign(height, hash, &checkpoint_key())
}

// ------------------------------------------------------------------
// Mempool double
// ------------------------------------------------------------------

/// Mempool that records every call it receives.
#[derive(Debug, Default)]
pub struct RecordingMempool {
    reorgs: Mutex<Vec<(Vec<Hash256>, bool)>>,
    confirmed: Mutex<Vec<u64>>,
}

impl RecordingMempool {
    /// `(txids, add_back)` per reconcile call, oldest first.
    pub fn reorgs(&self) -> Vec<(Vec<Hash256>, bool)> {
        self.reorgs.lock().clone()
    }

    /// Heights passed to `remove_confirmed`, in call order.
    pub fn confirmed_heights(&self) -> Vec<u64> {
        self.confirmed.lock().clone()
    }
}

impl MempoolSink for RecordingMempool {
    fn reconcile_after_reorg(&self, removed: &[Transaction], add_back: bool) {
        let txids = removed.iter().map(Transaction::txid).collect();
        self.reorgs.lock().push((txids, add_back));
    }

    fn remove_confirmed(&self, _txs: &[Transaction], height: u64) {
        self.confirmed.lock().push(height);
    }
}

// ------------------------------------------------------------------
// Node
// ------------------------------------------------------------------

/// Regtest configuration rooted at `dir`, with consistency checks on.
pub fn test_config(dir: PathBuf) -> ChainstateConfig {
    ChainstateConfig {
        data_dir: dir,
        network: NetworkType::Regtest,
        coins_cache_bytes: 32 * 1024 * 1024,
        script_threads: 2,
        max_block_file_size: 1024 * 1024,
        block_chunk_size: 64 * 1024,
        undo_chunk_size: 16 * 1024,
        txindex: true,
        checkpoints: true,
        consistency_checks: true,
        ..ChainstateConfig::default()
    }
}

/// A chain state on a temporary directory.
pub struct TestNode {
    pub chain: Arc<Chainstate>,
    pub clock: Arc<FixedClock>,
    pub mempool: Arc<RecordingMempool>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(f: impl FnOnce(&mut ChainstateConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path().to_path_buf());
        f(&mut config);
        Self::open(dir, config)
    }

    /// Open a chain state on an existing directory.
    pub fn open(dir: TempDir, config: ChainstateConfig) -> Self {
        let clock = Arc::new(FixedClock::new(TEST_NOW));
        let mempool = Arc::new(RecordingMempool::default());
        let collab = Collaborators {
            verifier: Arc::new(Ed25519Verifier),
            mempool: mempool.clone(),
            clock: clock.clone(),
        };
        let chain = Chainstate::open(config, collab).unwrap();
        Self {
            chain,
            clock,
            mempool,
            dir,
        }
    }

    /// Flush everything and release the databases.
    pub fn close(self) -> (TempDir, ChainstateConfig) {
        let config = self.chain.config().clone();
        self.chain.flush_state(FlushMode::Always).unwrap();
        let TestNode { chain, dir, .. } = self;
        drop(chain);
        (dir, config)
    }

    /// Close and open again on the same directory.
    pub fn reopen(self) -> Self {
        let (dir, config) = self.close();
        Self::open(dir, config)
    }

    pub fn tip(&self) -> BlockInfo {
        self.chain.active_tip()
    }

    pub fn info(&self, hash: &Hash256) -> BlockInfo {
        self.chain.block_index_lookup(hash).unwrap()
    }

    /// Build a block on `parent`, which must be in the block index.
    pub fn block_on(&self, parent: &Hash256, tag: u8, txs: Vec<Transaction>, fees: u64) -> Block {
        let p = self.info(parent);
        make_block((p.hash, p.height, p.timestamp), tag, txs, fees)
    }

    /// Build `n` blocks on `parent` without submitting them.
    pub fn branch(&self, parent: &Hash256, n: usize, tag: u8) -> Vec<Block> {
        let p = self.info(parent);
        build_branch((p.hash, p.height, p.timestamp), n, tag)
    }

    /// Submit blocks in order, requiring each to be accepted.
    pub fn submit(&self, blocks: &[Block]) {
        for b in blocks {
            self.chain.process_new_block(b, true).unwrap();
        }
    }

    /// Mine `n` empty blocks on the active tip.
    pub fn mine(&self, n: usize) -> Vec<Block> {
        let blocks = self.branch(&self.tip().hash, n, 0);
        self.submit(&blocks);
        blocks
    }

    /// Path of the node's block file `file`.
    pub fn block_file(&self, file: u32) -> PathBuf {
        self.chain
            .config()
            .blocks_dir()
            .join(format!("blk{file:05}.dat"))
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------
// Builders
// ------------------------------------------------------------------

pub fn genesis_hash() -> Hash256 {
    genesis_block(NetworkType::Regtest).hash()
}

/// Coinbase paying `value` to the miner. `tag` separates otherwise equal
/// coinbases on competing branches.
pub fn coinbase(height: u64, value: u64, tag: u8) -> Transaction {
    let mut data = height.to_le_bytes().to_vec();
    data.push(tag);
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature: data,
            public_key: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOutput {
            value,
            script_pubkey: miner().p2pkh_script(),
        }],
        lock_time: 0,
    }
}

/// Block on `(parent hash, parent height, parent timestamp)`.
///
/// The coinbase claims the subsidy plus `fees`. A witness commitment is
/// added when any transaction carries witness data.
pub fn make_block(parent: (Hash256, u64, u64), tag: u8, txs: Vec<Transaction>, fees: u64) -> Block {
    let (prev_hash, parent_height, parent_time) = parent;
    let height = parent_height + 1;
    let value = block_subsidy(height, regtest().subsidy_halving_interval) + fees;

    let mut transactions = vec![coinbase(height, value, tag)];
    transactions.extend(txs);
    let mut block = Block {
        header: BlockHeader {
            version: 4,
            prev_hash,
            merkle_root: Hash256::ZERO,
            timestamp: parent_time + BLOCK_SPACING,
            difficulty_target: u64::MAX,
            nonce: 0,
        },
        transactions,
    };

    if block.transactions.iter().any(Transaction::has_witness) {
        let root = merkle::block_witness_merkle_root(&block);
        block.transactions[0].outputs.push(TxOutput {
            value: 0,
            script_pubkey: merkle::witness_commitment_script(&root),
        });
    }
    block.header.merkle_root = merkle::block_merkle_root(&block).0;
    block
}

/// `n` empty blocks, each on the previous one.
pub fn build_branch(parent: (Hash256, u64, u64), n: usize, tag: u8) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::with_capacity(n);
    let mut p = parent;
    for _ in 0..n {
        let b = make_block(p, tag, Vec::new(), 0);
        p = (b.hash(), p.1 + 1, b.header.timestamp);
        out.push(b);
    }
    out
}

/// Outpoint of a block's coinbase payout.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

/// Signed transaction spending a miner-owned coin to `to`, paying `fee`.
pub fn spend(outpoint: &OutPoint, coin: &Coin, to: &KeyPair, fee: u64) -> Transaction {
    let mut tx = Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: outpoint.clone(),
            signature: Vec::new(),
            public_key: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TxOutput {
            value: coin.output.value - fee,
            script_pubkey: to.p2pkh_script(),
        }],
        lock_time: 0,
    };
    sign_transaction_input(&mut tx, 0, coin, &miner()).unwrap();
    tx
}
