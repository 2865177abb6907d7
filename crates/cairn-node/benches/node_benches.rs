//! Criterion benchmarks for cairn-node-lib hot paths.
//!
//! Covers: skip-pointer ancestor lookup, best-candidate selection over a wide
//! fork set, and block record write/read through the flat-file store.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use cairn_consensus::CheckpointSet;
use cairn_core::constants::NetworkType;
use cairn_core::genesis::genesis_block;
use cairn_core::types::{BlockHeader, Hash256};

use cairn_node_lib::block_index::{BlockId, BlockIndex};
use cairn_node_lib::block_store::{BlockStore, DiskPos, FileLimits};
use cairn_node_lib::chain::ActiveChain;

fn header(prev: Hash256, nonce: u64) -> BlockHeader {
    BlockHeader {
        version: 4,
        prev_hash: prev,
        merkle_root: Hash256::ZERO,
        timestamp: 1_000 + nonce,
        difficulty_target: u64::MAX,
        nonce,
    }
}

/// Index with a linear chain of `len` blocks above genesis, all with data.
fn linear_index(len: u64) -> (BlockIndex, BlockId, BlockId) {
    let mut index = BlockIndex::new();
    let genesis = index.insert_genesis(header(Hash256::ZERO, 0));
    index.mark_transactions_received(genesis, 1, DiskPos { file: 0, offset: 8 }, None);
    let mut cur = genesis;
    for n in 1..=len {
        let h = header(index.get(cur).hash, n);
        cur = index.register_header(&h, |_, _| Ok(())).unwrap();
        index.mark_transactions_received(cur, 1, DiskPos { file: 0, offset: n * 100 }, Some(genesis));
    }
    (index, genesis, cur)
}

fn bench_ancestor(c: &mut Criterion) {
    let (index, _, tip) = linear_index(20_000);
    c.bench_function("ancestor_lookup_20k", |b| {
        b.iter(|| index.ancestor(black_box(tip), black_box(1_234)))
    });
}

fn bench_best_candidate(c: &mut Criterion) {
    // 200 short forks hanging off a 1_000 block trunk, none connected yet.
    let (mut index, genesis, trunk_tip) = linear_index(1_000);
    let chain = ActiveChain::new(genesis);
    let mut nonce = 1_000_000;
    for fork in 0..200u64 {
        let base = index.ancestor(trunk_tip, 500 + fork * 2).unwrap();
        let mut cur = base;
        for _ in 0..3 {
            nonce += 1;
            let h = header(index.get(cur).hash, nonce);
            cur = index.register_header(&h, |_, _| Ok(())).unwrap();
            index.mark_transactions_received(cur, 1, DiskPos { file: 1, offset: nonce }, Some(genesis));
        }
    }
    let checkpoints = CheckpointSet::new();
    c.bench_function("find_best_candidate_200_forks", |b| {
        b.iter(|| index.find_best_candidate(black_box(&chain), &checkpoints))
    });
}

fn bench_block_store(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let limits = FileLimits {
        max_file_size: 128 * 1024 * 1024,
        block_chunk: 16 * 1024 * 1024,
        undo_chunk: 1024 * 1024,
    };
    let store = BlockStore::open(dir.path(), *b"cair", limits, Vec::new(), 0).unwrap();
    let block = genesis_block(NetworkType::Regtest);

    c.bench_function("block_store_write", |b| {
        b.iter(|| store.write_block(black_box(block), 1, None).unwrap())
    });

    let pos = store.write_block(block, 1, None).unwrap();
    c.bench_function("block_store_read", |b| {
        b.iter(|| store.read_block(black_box(pos)).unwrap())
    });
}

criterion_group!(benches, bench_ancestor, bench_best_candidate, bench_block_store);
criterion_main!(benches);
