//! RocksDB-backed coin database.
//!
//! The bottom layer of the coin view stack. Besides the coins it stores the
//! head-blocks record, which tells a restart whether the last flush finished:
//!
//! - `[best]`: the set reflects exactly the chain ending at `best`.
//! - `[new, old]`: a flush from `old` to `new` was interrupted. The set holds
//!   a mix of both states; [`crate::utxo::replay_blocks`] repairs it.
//!
//! A flush first records `[new, old]`, then writes coins in bounded
//! batches, then records `[new]` with a synced write.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::{debug, info};

use cairn_core::coins::{CoinsMap, CoinsView, CoinsWrite};
use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::types::{Coin, Hash256, OutPoint};

// --- Column family names ---

const CF_COINS: &str = "coins";
const CF_METADATA: &str = "metadata";

const ALL_CFS: &[&str] = &[CF_COINS, CF_METADATA];

// --- Metadata keys ---

const META_HEAD_BLOCKS: &[u8] = b"head_blocks";

/// Coin writes per batch during a flush.
pub const DEFAULT_BATCH_SIZE: usize = 16_384;

pub struct CoinsDb {
    db: DB,
    batch_size: usize,
}

fn storage_err(e: impl std::fmt::Display) -> CairnError {
    CairnError::Storage(e.to_string())
}

fn encode_outpoint(outpoint: &OutPoint) -> Result<Vec<u8>, CairnError> {
    bincode::encode_to_vec(outpoint, bincode::config::standard()).map_err(storage_err)
}

impl CoinsDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CairnError> {
        Self::open_with_batch_size(path, DEFAULT_BATCH_SIZE)
    }

    pub fn open_with_batch_size(path: impl AsRef<Path>, batch_size: usize) -> Result<Self, CairnError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        debug!(path = %path.as_ref().display(), "coin database opened");
        Ok(Self {
            db,
            batch_size: batch_size.max(1),
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CairnError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CairnError::Storage(format!("missing column family: {name}")))
    }

    /// The head-blocks record. Empty for a fresh database.
    pub fn head_blocks(&self) -> Result<Vec<Hash256>, CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, META_HEAD_BLOCKS).map_err(storage_err)? {
            Some(bytes) => bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map(|(heads, _)| heads)
                .map_err(storage_err),
            None => Ok(Vec::new()),
        }
    }

    /// Overwrite the head-blocks record with a synced write.
    pub fn write_head_blocks(&self, heads: &[Hash256]) -> Result<(), CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        let bytes = bincode::encode_to_vec(heads.to_vec(), bincode::config::standard())
            .map_err(storage_err)?;
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db
            .put_cf_opt(cf, META_HEAD_BLOCKS, bytes, &opts)
            .map_err(storage_err)
    }

    /// Number of stored coins. Walks the whole column family.
    pub fn coin_count(&self) -> Result<usize, CairnError> {
        let cf = self.cf_handle(CF_COINS)?;
        let mut n = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(storage_err)?;
            n += 1;
        }
        Ok(n)
    }

    /// Remove every coin and the head-blocks record.
    pub fn wipe(&self) -> Result<(), CairnError> {
        let cf = self.cf_handle(CF_COINS)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item.map_err(storage_err)?;
            batch.delete_cf(cf, key);
        }
        batch.delete_cf(self.cf_handle(CF_METADATA)?, META_HEAD_BLOCKS);
        self.db.write(batch).map_err(storage_err)?;
        info!("coin database wiped");
        Ok(())
    }
}

impl CoinsView for CoinsDb {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        let cf = self.cf_handle(CF_COINS)?;
        match self
            .db
            .get_cf(cf, encode_outpoint(outpoint)?)
            .map_err(storage_err)?
        {
            Some(bytes) => bincode::decode_from_slice(&bytes, bincode::config::standard())
                .map(|(coin, _)| Some(coin))
                .map_err(storage_err),
            None => Ok(None),
        }
    }

    /// The single head block, or zero when the database is fresh or torn.
    fn best_block(&self) -> Result<Hash256, CairnError> {
        let heads = self.head_blocks()?;
        Ok(match heads.as_slice() {
            [best] => *best,
            _ => Hash256::ZERO,
        })
    }
}

impl CoinsWrite for CoinsDb {
    fn batch_write(&mut self, changes: CoinsMap, best_block: Hash256) -> Result<(), CairnError> {
        let heads = self.head_blocks()?;
        let old_tip = match heads.as_slice() {
            [] => Hash256::ZERO,
            [best] => *best,
            [new, old] => {
                // Finishing an interrupted flush: it must target the same block.
                if *new != best_block {
                    return Err(ChainStateError::Inconsistent(format!(
                        "interrupted flush towards {new}, now flushing {best_block}"
                    ))
                    .into());
                }
                *old
            }
            _ => {
                return Err(ChainStateError::Inconsistent(format!(
                    "unexpected head-blocks record of {} entries",
                    heads.len()
                ))
                .into())
            }
        };

        self.write_head_blocks(&[best_block, old_tip])?;

        let cf = self.cf_handle(CF_COINS)?;
        let mut batch = WriteBatch::default();
        let mut pending = 0usize;
        let mut written = 0usize;
        let mut erased = 0usize;
        for (outpoint, entry) in changes {
            if !entry.dirty {
                continue;
            }
            let key = encode_outpoint(&outpoint)?;
            match entry.coin {
                Some(coin) => {
                    let value = bincode::encode_to_vec(&coin, bincode::config::standard())
                        .map_err(storage_err)?;
                    batch.put_cf(cf, key, value);
                    written += 1;
                }
                None => {
                    batch.delete_cf(cf, key);
                    erased += 1;
                }
            }
            pending += 1;
            if pending >= self.batch_size {
                self.db
                    .write(std::mem::take(&mut batch))
                    .map_err(storage_err)?;
                pending = 0;
            }
        }
        if pending > 0 {
            self.db.write(batch).map_err(storage_err)?;
        }

        self.write_head_blocks(&[best_block])?;
        debug!(written, erased, best = %best_block, "coin database flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::coins::{CacheEntry, CoinsViewCache};
    use cairn_core::types::TxOutput;

    fn temp_db() -> (CoinsDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoinsDb::open_with_batch_size(dir.path().join("chainstate"), 2).unwrap();
        (db, dir)
    }

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), 0)
    }

    fn coin(value: u64) -> Coin {
        Coin::new(
            TxOutput {
                value,
                script_pubkey: vec![1; 32],
            },
            1,
            false,
        )
    }

    fn dirty(c: Option<Coin>) -> CacheEntry {
        CacheEntry {
            coin: c,
            dirty: true,
            fresh: false,
        }
    }

    // ------------------------------------------------------------------
    // Head blocks
    // ------------------------------------------------------------------

    #[test]
    fn fresh_database_has_no_heads() {
        let (db, _dir) = temp_db();
        assert!(db.head_blocks().unwrap().is_empty());
        assert_eq!(db.best_block().unwrap(), Hash256::ZERO);
    }

    #[test]
    fn torn_heads_report_no_best_block() {
        let (db, _dir) = temp_db();
        db.write_head_blocks(&[Hash256([2; 32]), Hash256([1; 32])]).unwrap();
        assert_eq!(db.best_block().unwrap(), Hash256::ZERO);
    }

    #[test]
    fn completed_flush_leaves_single_head() {
        let (mut db, _dir) = temp_db();
        let changes: CoinsMap = (1..=5).map(|n| (op(n), dirty(Some(coin(n as u64))))).collect();
        db.batch_write(changes, Hash256([9; 32])).unwrap();
        assert_eq!(db.head_blocks().unwrap(), vec![Hash256([9; 32])]);
        assert_eq!(db.coin_count().unwrap(), 5);
        assert_eq!(db.get_coin(&op(3)).unwrap(), Some(coin(3)));
    }

    #[test]
    fn spends_are_deleted_and_clean_entries_skipped() {
        let (mut db, _dir) = temp_db();
        let mut first = CoinsMap::new();
        first.insert(op(1), dirty(Some(coin(1))));
        first.insert(op(2), dirty(Some(coin(2))));
        db.batch_write(first, Hash256([1; 32])).unwrap();

        let mut second = CoinsMap::new();
        second.insert(op(1), dirty(None));
        second.insert(
            op(3),
            CacheEntry {
                coin: Some(coin(3)),
                dirty: false,
                fresh: false,
            },
        );
        db.batch_write(second, Hash256([2; 32])).unwrap();

        assert_eq!(db.get_coin(&op(1)).unwrap(), None);
        assert_eq!(db.get_coin(&op(2)).unwrap(), Some(coin(2)));
        assert_eq!(db.get_coin(&op(3)).unwrap(), None);
    }

    #[test]
    fn finishing_interrupted_flush_must_target_same_block() {
        let (mut db, _dir) = temp_db();
        db.write_head_blocks(&[Hash256([2; 32]), Hash256([1; 32])]).unwrap();
        assert!(db.batch_write(CoinsMap::new(), Hash256([3; 32])).is_err());
        db.batch_write(CoinsMap::new(), Hash256([2; 32])).unwrap();
        assert_eq!(db.head_blocks().unwrap(), vec![Hash256([2; 32])]);
    }

    #[test]
    fn cache_flushes_into_database() {
        let (db, _dir) = temp_db();
        let mut cache = CoinsViewCache::new(db);
        cache.add_coin(op(7), coin(70), false).unwrap();
        cache.set_best_block(Hash256([7; 32]));
        cache.flush().unwrap();
        assert_eq!(cache.base().get_coin(&op(7)).unwrap(), Some(coin(70)));
        assert_eq!(cache.base().best_block().unwrap(), Hash256([7; 32]));
    }

    #[test]
    fn wipe_clears_everything() {
        let (mut db, _dir) = temp_db();
        let changes: CoinsMap = [(op(1), dirty(Some(coin(1))))].into_iter().collect();
        db.batch_write(changes, Hash256([1; 32])).unwrap();
        db.wipe().unwrap();
        assert_eq!(db.coin_count().unwrap(), 0);
        assert!(db.head_blocks().unwrap().is_empty());
    }
}
