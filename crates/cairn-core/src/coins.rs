//! Layered coin views.
//!
//! A [`CoinsViewCache`] sits on top of any [`CoinsView`] and records changes
//! in memory. Each cached entry carries two flags:
//!
//! - `dirty`: the entry differs from the layer below and must be written.
//! - `fresh`: the layer below has no unspent version of this coin, so
//!   spending it can drop the entry instead of writing a deletion.
//!
//! Caches stack. Block connection uses a short-lived cache over the node's
//! long-lived one; its changes are merged with [`CoinsViewCache::into_changes`]
//! and [`CoinsWrite::batch_write`] only when the whole block succeeds.

use std::collections::HashMap;

use crate::error::{CairnError, ChainStateError};
use crate::types::{Coin, Hash256, OutPoint, Transaction};

/// Read access to a set of unspent coins.
pub trait CoinsView {
    /// The unspent coin at `outpoint`, if any.
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError>;

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CairnError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Block whose effects this view reflects. [`Hash256::ZERO`] when empty.
    fn best_block(&self) -> Result<Hash256, CairnError>;
}

/// A view that can absorb a batch of cache changes.
pub trait CoinsWrite: CoinsView {
    /// Apply every dirty entry of `changes` and move the best block.
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), CairnError>;
}

impl<T: CoinsView + ?Sized> CoinsView for &T {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        (**self).get_coin(outpoint)
    }

    fn have_coin(&self, outpoint: &OutPoint) -> Result<bool, CairnError> {
        (**self).have_coin(outpoint)
    }

    fn best_block(&self) -> Result<Hash256, CairnError> {
        (**self).best_block()
    }
}

/// One cached coin. `coin == None` records a spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub coin: Option<Coin>,
    pub dirty: bool,
    pub fresh: bool,
}

impl CacheEntry {
    fn clean(coin: Option<Coin>) -> Self {
        Self {
            coin,
            dirty: false,
            fresh: false,
        }
    }
}

pub type CoinsMap = HashMap<OutPoint, CacheEntry>;

/// In-memory write-back cache over a base view.
pub struct CoinsViewCache<B> {
    base: B,
    cache: CoinsMap,
    best_block: Hash256,
    usage: usize,
}

const ENTRY_OVERHEAD: usize =
    std::mem::size_of::<OutPoint>() + std::mem::size_of::<CacheEntry>();

fn entry_usage(entry: &CacheEntry) -> usize {
    ENTRY_OVERHEAD + entry.coin.as_ref().map_or(0, Coin::dynamic_usage)
}

impl<B: CoinsView> CoinsViewCache<B> {
    pub fn new(base: B) -> Self {
        Self {
            base,
            cache: HashMap::new(),
            best_block: Hash256::ZERO,
            usage: 0,
        }
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    fn insert_entry(&mut self, outpoint: OutPoint, entry: CacheEntry) {
        self.usage += entry_usage(&entry);
        if let Some(old) = self.cache.insert(outpoint, entry) {
            self.usage -= entry_usage(&old);
        }
    }

    fn remove_entry(&mut self, outpoint: &OutPoint) -> Option<CacheEntry> {
        let old = self.cache.remove(outpoint)?;
        self.usage -= entry_usage(&old);
        Some(old)
    }

    /// Pull `outpoint` into the cache if the base has it.
    fn fetch(&mut self, outpoint: &OutPoint) -> Result<bool, CairnError> {
        if self.cache.contains_key(outpoint) {
            return Ok(true);
        }
        match self.base.get_coin(outpoint)? {
            Some(coin) => {
                self.insert_entry(outpoint.clone(), CacheEntry::clean(Some(coin)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up a coin, caching it for later spends.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        if !self.fetch(outpoint)? {
            return Ok(None);
        }
        Ok(self.cache.get(outpoint).and_then(|e| e.coin.clone()))
    }

    /// Add a new unspent coin.
    ///
    /// Unless `possible_overwrite` is set, the outpoint must not already be
    /// unspent in this cache.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        possible_overwrite: bool,
    ) -> Result<(), CairnError> {
        let existing = self.cache.get(&outpoint);
        if !possible_overwrite && existing.is_some_and(|e| e.coin.is_some()) {
            return Err(ChainStateError::CoinOverwrite(outpoint.to_string()).into());
        }
        // A spent entry not yet written below can come back as fresh.
        let fresh = existing.is_some_and(|e| e.fresh)
            || (!possible_overwrite && !existing.is_some_and(|e| e.dirty));
        self.insert_entry(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(())
    }

    /// Spend a coin, returning it. `Ok(None)` when it was not unspent.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        if !self.fetch(outpoint)? {
            return Ok(None);
        }
        let Some(entry) = self.remove_entry(outpoint) else {
            return Ok(None);
        };
        let Some(coin) = entry.coin else {
            self.insert_entry(outpoint.clone(), entry);
            return Ok(None);
        };
        if !entry.fresh {
            self.insert_entry(
                outpoint.clone(),
                CacheEntry {
                    coin: None,
                    dirty: true,
                    fresh: false,
                },
            );
        }
        Ok(Some(coin))
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    /// Number of cached entries, spent ones included.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Approximate memory held by the cache, in bytes.
    pub fn dynamic_usage(&self) -> usize {
        self.usage
    }

    /// Drop a clean entry from memory.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if self.cache.get(outpoint).is_some_and(|e| !e.dirty && !e.fresh) {
            self.remove_entry(outpoint);
        }
    }

    /// Consume the cache, yielding its changes and best block.
    pub fn into_changes(self) -> (CoinsMap, Hash256) {
        (self.cache, self.best_block)
    }
}

impl<B: CoinsWrite> CoinsViewCache<B> {
    /// Write every change to the base and empty the cache.
    pub fn flush(&mut self) -> Result<(), CairnError> {
        let changes = std::mem::take(&mut self.cache);
        self.usage = 0;
        let best = self.best_block()?;
        self.base.batch_write(changes, best)
    }
}

impl<B: CoinsView> CoinsView for CoinsViewCache<B> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        match self.cache.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Hash256, CairnError> {
        if self.best_block.is_zero() {
            self.base.best_block()
        } else {
            Ok(self.best_block)
        }
    }
}

impl<B: CoinsView> CoinsWrite for CoinsViewCache<B> {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), CairnError> {
        for (outpoint, child) in changes {
            if !child.dirty {
                continue;
            }
            match self.cache.get(&outpoint) {
                None => {
                    // A fresh spend never reached any lower layer.
                    if child.fresh && child.coin.is_none() {
                        continue;
                    }
                    self.insert_entry(
                        outpoint,
                        CacheEntry {
                            coin: child.coin,
                            dirty: true,
                            fresh: child.fresh,
                        },
                    );
                }
                Some(parent) => {
                    if child.fresh && parent.coin.is_some() {
                        return Err(ChainStateError::FreshMisapplied(outpoint.to_string()).into());
                    }
                    let parent_fresh = parent.fresh;
                    if parent_fresh && child.coin.is_none() {
                        self.remove_entry(&outpoint);
                    } else {
                        self.insert_entry(
                            outpoint,
                            CacheEntry {
                                coin: child.coin,
                                dirty: true,
                                fresh: parent_fresh,
                            },
                        );
                    }
                }
            }
        }
        self.best_block = best_block;
        Ok(())
    }
}

/// Add every output of `tx` as a coin at `height`.
///
/// With `check_overwrite` the view is consulted for each outpoint; otherwise
/// only coinbase outputs may overwrite, which holds while txids are unique.
pub fn add_coins<B: CoinsView>(
    view: &mut CoinsViewCache<B>,
    tx: &Transaction,
    height: u64,
    check_overwrite: bool,
) -> Result<(), CairnError> {
    let txid = tx.txid();
    let is_coinbase = tx.is_coinbase();
    for (index, output) in tx.outputs.iter().enumerate() {
        let outpoint = OutPoint::new(txid, index as u64);
        let overwrite = if check_overwrite {
            view.have_coin(&outpoint)?
        } else {
            is_coinbase
        };
        view.add_coin(
            outpoint,
            Coin::new(output.clone(), height, is_coinbase),
            overwrite,
        )?;
    }
    Ok(())
}

/// Plain in-memory coin set. Backs tests and tools.
#[derive(Debug, Default, Clone)]
pub struct MemoryCoinsView {
    coins: HashMap<OutPoint, Coin>,
    best_block: Hash256,
}

impl MemoryCoinsView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    /// Copy of the whole set, for comparisons.
    pub fn snapshot(&self) -> HashMap<OutPoint, Coin> {
        self.coins.clone()
    }
}

impl CoinsView for MemoryCoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        Ok(self.coins.get(outpoint).cloned())
    }

    fn best_block(&self) -> Result<Hash256, CairnError> {
        Ok(self.best_block)
    }
}

impl CoinsWrite for MemoryCoinsView {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), CairnError> {
        for (outpoint, entry) in changes {
            if !entry.dirty {
                continue;
            }
            match entry.coin {
                Some(coin) => {
                    self.coins.insert(outpoint, coin);
                }
                None => {
                    self.coins.remove(&outpoint);
                }
            }
        }
        self.best_block = best_block;
        Ok(())
    }
}
