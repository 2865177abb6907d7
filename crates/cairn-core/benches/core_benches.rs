//! Criterion benchmarks for cairn-core hot paths.
//!
//! Covers: merkle roots, txid hashing, coin cache churn, and undo
//! record serialization.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cairn_core::coins::{CoinsViewCache, MemoryCoinsView};
use cairn_core::crypto::KeyPair;
use cairn_core::merkle::merkle_root;
use cairn_core::types::{
    BlockUndo, Coin, Hash256, OutPoint, Transaction, TxInput, TxOutput, TxUndo,
};

fn make_txids(n: usize) -> Vec<Hash256> {
    (0..n)
        .map(|i| Hash256(*blake3::hash(&(i as u64).to_le_bytes()).as_bytes()))
        .collect()
}

fn sample_transaction() -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::new(Hash256([0x11; 32]), 0),
            signature: vec![0u8; 64],
            public_key: vec![0u8; 32],
            sequence: u32::MAX,
        }],
        outputs: vec![
            TxOutput {
                value: 50 * 100_000_000,
                script_pubkey: vec![0xCC; 32],
            },
            TxOutput {
                value: 25 * 100_000_000,
                script_pubkey: vec![0xDD; 32],
            },
        ],
        lock_time: 0,
    }
}

fn sample_coin(value: u64) -> Coin {
    Coin::new(
        TxOutput {
            value,
            script_pubkey: vec![0xEE; 32],
        },
        100,
        false,
    )
}

fn bench_merkle_root(c: &mut Criterion) {
    let txids_10 = make_txids(10);
    let txids_1000 = make_txids(1000);

    c.bench_function("merkle_root_10_txids", |b| {
        b.iter(|| merkle_root(black_box(&txids_10)))
    });

    c.bench_function("merkle_root_1000_txids", |b| {
        b.iter(|| merkle_root(black_box(&txids_1000)))
    });
}

fn bench_txid(c: &mut Criterion) {
    let tx = sample_transaction();

    c.bench_function("txid", |b| b.iter(|| black_box(&tx).txid()));
    c.bench_function("wtxid", |b| b.iter(|| black_box(&tx).wtxid()));
}

fn bench_ed25519_verify(c: &mut Criterion) {
    let keypair = KeyPair::from_secret_bytes([42u8; 32]);
    let message = blake3::hash(b"bench message");
    let msg_bytes = message.as_bytes();
    let signature = keypair.sign(msg_bytes);
    let pubkey = keypair.public_key();

    c.bench_function("ed25519_verify", |b| {
        b.iter(|| pubkey.verify(black_box(msg_bytes), black_box(&signature)))
    });
}

fn bench_coin_cache(c: &mut Criterion) {
    let outpoints: Vec<OutPoint> = make_txids(1000)
        .into_iter()
        .map(|txid| OutPoint::new(txid, 0))
        .collect();

    c.bench_function("coin_cache_add_spend_flush_1000", |b| {
        b.iter(|| {
            let mut cache = CoinsViewCache::new(MemoryCoinsView::new());
            for (i, op) in outpoints.iter().enumerate() {
                let _ = cache.add_coin(op.clone(), sample_coin(i as u64), false);
            }
            for op in outpoints.iter().step_by(2) {
                let _ = cache.spend_coin(op);
            }
            let _ = cache.flush();
            black_box(cache.base().len())
        })
    });
}

fn bench_undo_serde(c: &mut Criterion) {
    let undo = BlockUndo {
        txs: (0..200)
            .map(|i| TxUndo {
                prev_coins: vec![sample_coin(i), sample_coin(i + 1)],
            })
            .collect(),
    };
    let encoded =
        bincode::encode_to_vec(&undo, bincode::config::standard()).expect("encode failed");

    c.bench_function("block_undo_encode_200_txs", |b| {
        b.iter(|| bincode::encode_to_vec(black_box(&undo), bincode::config::standard()))
    });

    c.bench_function("block_undo_decode_200_txs", |b| {
        b.iter(|| {
            let (decoded, _): (BlockUndo, usize) =
                bincode::decode_from_slice(black_box(&encoded), bincode::config::standard())
                    .expect("decode failed");
            decoded
        })
    });
}

criterion_group!(
    benches,
    bench_merkle_root,
    bench_txid,
    bench_ed25519_verify,
    bench_coin_cache,
    bench_undo_serde,
);
criterion_main!(benches);
