//! In-memory pool of unconfirmed transactions.
//!
//! The chain-state engine only talks to the pool through
//! [`MempoolSink`]: confirmed transactions leave the pool, and transactions
//! from disconnected blocks are offered back after a reorg.
//!
//! The pool provides:
//! - O(1) lookup by txid
//! - O(1) conflict detection via spent-outpoint index
//! - Size-limited storage with lowest-fee-rate eviction

use std::collections::{BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::MempoolError;
use crate::traits::MempoolSink;
use crate::types::{Hash256, OutPoint, Transaction};

/// Default maximum number of transactions in the pool.
pub const DEFAULT_MAX_COUNT: usize = 5_000;

/// Default maximum total serialized bytes in the pool (5 MiB).
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

/// Fee rate is stored as `fee * FEE_RATE_PRECISION / size`.
const FEE_RATE_PRECISION: u128 = 1_000;

fn compute_fee_rate(fee: u64, size: usize) -> u64 {
    if size == 0 {
        return u64::MAX;
    }
    let rate = (fee as u128) * FEE_RATE_PRECISION / (size as u128);
    rate.min(u64::MAX as u128) as u64
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u64,
    /// Full serialized size in bytes.
    pub size: usize,
    fee_rate: u64,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> u64 {
        self.fee_rate
    }
}

/// Pool of unconfirmed transactions, indexed by txid and spent outpoint.
///
/// Not thread-safe. [`MempoolSink`] is implemented for `Mutex<Mempool>`.
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    /// Spent outpoint → txid of the pool transaction that spends it.
    by_outpoint: HashMap<OutPoint, Hash256>,
    /// Ascending `(fee_rate, txid)`; the front is evicted first.
    by_fee_rate: BTreeSet<(u64, Hash256)>,
    max_count: usize,
    max_bytes: usize,
    total_bytes: usize,
}

impl Mempool {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_outpoint: HashMap::new(),
            by_fee_rate: BTreeSet::new(),
            max_count,
            max_bytes,
            total_bytes: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_COUNT, DEFAULT_MAX_BYTES)
    }

    /// Insert a transaction the caller has already validated.
    ///
    /// When the pool is full, lower-fee-rate entries are evicted as long as
    /// the new transaction pays a strictly higher rate.
    pub fn insert(&mut self, tx: Transaction, fee: u64) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        let size = tx.total_size();

        if self.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid.to_string()));
        }
        for input in &tx.inputs {
            if let Some(existing) = self.by_outpoint.get(&input.previous_output) {
                return Err(MempoolError::Conflict {
                    existing_txid: existing.to_string(),
                    outpoint: input.previous_output.to_string(),
                });
            }
        }

        let fee_rate = compute_fee_rate(fee, size);
        while self.is_over(size) && !self.entries.is_empty() {
            match self.by_fee_rate.iter().next() {
                Some(&(lowest_rate, lowest_txid)) if lowest_rate < fee_rate => {
                    self.remove_entry(lowest_txid);
                }
                _ => return Err(MempoolError::PoolFull),
            }
        }
        if self.is_over(size) {
            return Err(MempoolError::PoolFull);
        }

        for input in &tx.inputs {
            self.by_outpoint.insert(input.previous_output.clone(), txid);
        }
        self.by_fee_rate.insert((fee_rate, txid));
        self.total_bytes += size;
        self.entries.insert(
            txid,
            MempoolEntry {
                tx,
                txid,
                fee,
                size,
                fee_rate,
            },
        );
        Ok(txid)
    }

    fn is_over(&self, extra: usize) -> bool {
        self.entries.len() >= self.max_count || self.total_bytes + extra > self.max_bytes
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        self.remove_entry(*txid)
    }

    fn remove_entry(&mut self, txid: Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(&txid)?;
        for input in &entry.tx.inputs {
            self.by_outpoint.remove(&input.previous_output);
        }
        self.by_fee_rate.remove(&(entry.fee_rate, txid));
        self.total_bytes -= entry.size;
        Some(entry)
    }

    /// Remove `txid` and every pool transaction that spends its outputs.
    fn remove_with_descendants(&mut self, txid: Hash256) -> usize {
        let mut queue = vec![txid];
        let mut removed = 0;
        while let Some(next) = queue.pop() {
            let Some(entry) = self.remove_entry(next) else {
                continue;
            };
            removed += 1;
            for index in 0..entry.tx.outputs.len() as u64 {
                if let Some(child) = self.by_outpoint.get(&OutPoint::new(next, index)) {
                    queue.push(*child);
                }
            }
        }
        removed
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Whether any input of `tx` is already spent by a pool transaction.
    pub fn has_conflict(&self, tx: &Transaction) -> bool {
        tx.inputs
            .iter()
            .any(|input| self.by_outpoint.contains_key(&input.previous_output))
    }

    /// Remove confirmed transactions and any pool entry they conflict with.
    pub fn remove_confirmed_txs(&mut self, txs: &[Transaction]) {
        let mut spent = HashSet::new();
        for tx in txs {
            self.remove_entry(tx.txid());
            if !tx.is_coinbase() {
                spent.extend(tx.inputs.iter().map(|i| i.previous_output.clone()));
            }
        }
        let conflicting: HashSet<Hash256> = spent
            .iter()
            .filter_map(|op| self.by_outpoint.get(op).copied())
            .collect();
        for txid in conflicting {
            self.remove_with_descendants(txid);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn total_fees(&self) -> u64 {
        self.entries.values().map(|e| e.fee).sum()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.entries.keys().copied().collect()
    }
}

impl MempoolSink for Mutex<Mempool> {
    fn reconcile_after_reorg(&self, removed: &[Transaction], add_back: bool) {
        let mut pool = self.lock();
        if add_back {
            let mut readded = 0usize;
            for tx in removed.iter().filter(|tx| !tx.is_coinbase()) {
                // Fees are unknown without the coin view; readmit at zero.
                if pool.insert(tx.clone(), 0).is_ok() {
                    readded += 1;
                }
            }
            debug!(readded, "mempool readmitted disconnected transactions");
        } else {
            let mut dropped = 0usize;
            for tx in removed {
                let txid = tx.txid();
                dropped += pool.remove_with_descendants(txid);
                for index in 0..tx.outputs.len() as u64 {
                    if let Some(child) = pool.by_outpoint.get(&OutPoint::new(txid, index)).copied() {
                        dropped += pool.remove_with_descendants(child);
                    }
                }
            }
            debug!(dropped, "mempool dropped transactions from disconnected blocks");
        }
    }

    fn remove_confirmed(&self, txs: &[Transaction], height: u64) {
        let mut pool = self.lock();
        let before = pool.len();
        pool.remove_confirmed_txs(txs);
        debug!(height, removed = before - pool.len(), "mempool removed confirmed");
    }
}
