//! RocksDB-backed block index database.
//!
//! Holds everything about blocks that is not the block itself: one
//! [`DiskBlockIndex`] record per known header, per-file statistics for the
//! flat files, the optional transaction index, verified checkpoints, and a
//! few persistent flags. Derived fields (cumulative work, skip pointers,
//! sequence ids) are recomputed on load.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::{debug, info};

use cairn_consensus::SignedCheckpoint;
use cairn_core::error::CairnError;
use cairn_core::types::{BlockHeader, Hash256};

use crate::block_index::{Failure, Validity};
use crate::block_store::{BlockFileInfo, DiskPos};

// --- Column family names ---

const CF_BLOCK_INDEX: &str = "block_index";
const CF_BLOCK_FILES: &str = "block_files";
const CF_TX_INDEX: &str = "tx_index";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_BLOCK_INDEX,
    CF_BLOCK_FILES,
    CF_TX_INDEX,
    CF_CHECKPOINTS,
    CF_METADATA,
];

// --- Metadata keys ---

const META_LAST_FILE: &[u8] = b"last_file";

/// Persistent boolean flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Set while a reindex has not finished.
    Reindexing,
    /// Set when undo data for old blocks may have been discarded.
    Pruned,
    /// Set while the transaction index is maintained.
    TxIndex,
}

impl Flag {
    fn key(self) -> &'static [u8] {
        match self {
            Flag::Reindexing => b"flag_reindexing",
            Flag::Pruned => b"flag_pruned",
            Flag::TxIndex => b"flag_txindex",
        }
    }
}

/// The persisted part of a block index entry.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DiskBlockIndex {
    pub header: BlockHeader,
    pub height: u64,
    pub validity: Validity,
    pub failure: Option<Failure>,
    pub data_pos: Option<DiskPos>,
    pub undo_pos: Option<DiskPos>,
    pub tx_count: u64,
}

impl DiskBlockIndex {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// Where a confirmed transaction lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct TxLocation {
    /// Position of the containing block.
    pub block_pos: DiskPos,
    /// Index of the transaction within the block.
    pub tx_index: u32,
}

/// RocksDB store for the block index and its side tables.
pub struct IndexDb {
    db: DB,
}

fn storage_err(e: impl std::fmt::Display) -> CairnError {
    CairnError::Storage(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, CairnError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, CairnError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(storage_err)
}

fn sync_write() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

impl IndexDb {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CairnError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(storage_err)?;
        debug!(path = %path.as_ref().display(), "block index database opened");
        Ok(Self { db })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, CairnError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CairnError::Storage(format!("missing column family: {name}")))
    }

    /// Atomically persist changed file infos, the last file number and
    /// changed index entries. Synced before returning.
    pub fn write_batch(
        &self,
        file_infos: &[(u32, BlockFileInfo)],
        last_file: u32,
        entries: &[DiskBlockIndex],
    ) -> Result<(), CairnError> {
        let cf_files = self.cf_handle(CF_BLOCK_FILES)?;
        let cf_index = self.cf_handle(CF_BLOCK_INDEX)?;
        let cf_meta = self.cf_handle(CF_METADATA)?;

        let mut batch = WriteBatch::default();
        for (file, info) in file_infos {
            batch.put_cf(cf_files, file.to_be_bytes(), encode(info)?);
        }
        batch.put_cf(cf_meta, META_LAST_FILE, last_file.to_be_bytes());
        for entry in entries {
            batch.put_cf(cf_index, entry.hash().as_bytes(), encode(entry)?);
        }
        self.db.write_opt(batch, &sync_write()).map_err(storage_err)?;
        debug!(
            files = file_infos.len(),
            entries = entries.len(),
            "block index batch written"
        );
        Ok(())
    }

    /// Every stored index entry, in key order.
    pub fn load_block_index(&self) -> Result<Vec<DiskBlockIndex>, CairnError> {
        let cf = self.cf_handle(CF_BLOCK_INDEX)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn read_file_info(&self, file: u32) -> Result<Option<BlockFileInfo>, CairnError> {
        let cf = self.cf_handle(CF_BLOCK_FILES)?;
        match self.db.get_cf(cf, file.to_be_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Infos for files `0..=last_file`, with defaults for gaps.
    pub fn read_file_infos(&self) -> Result<(Vec<BlockFileInfo>, u32), CairnError> {
        let last = self.last_file()?.unwrap_or(0);
        let mut infos = Vec::with_capacity(last as usize + 1);
        for file in 0..=last {
            infos.push(self.read_file_info(file)?.unwrap_or_default());
        }
        Ok((infos, last))
    }

    pub fn last_file(&self) -> Result<Option<u32>, CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        match self.db.get_cf(cf, META_LAST_FILE).map_err(storage_err)? {
            Some(bytes) => {
                let arr: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CairnError::Storage("invalid last_file length".into()))?;
                Ok(Some(u32::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn write_flag(&self, flag: Flag, value: bool) -> Result<(), CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        self.db
            .put_cf_opt(cf, flag.key(), [u8::from(value)], &sync_write())
            .map_err(storage_err)
    }

    pub fn read_flag(&self, flag: Flag) -> Result<bool, CairnError> {
        let cf = self.cf_handle(CF_METADATA)?;
        Ok(self
            .db
            .get_cf(cf, flag.key())
            .map_err(storage_err)?
            .is_some_and(|v| v.first() == Some(&1)))
    }

    pub fn write_tx_index(&self, locations: &[(Hash256, TxLocation)]) -> Result<(), CairnError> {
        if locations.is_empty() {
            return Ok(());
        }
        let cf = self.cf_handle(CF_TX_INDEX)?;
        let mut batch = WriteBatch::default();
        for (txid, loc) in locations {
            batch.put_cf(cf, txid.as_bytes(), encode(loc)?);
        }
        self.db.write(batch).map_err(storage_err)
    }

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<TxLocation>, CairnError> {
        let cf = self.cf_handle(CF_TX_INDEX)?;
        match self.db.get_cf(cf, txid.as_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist verified checkpoints, keyed by height.
    pub fn put_checkpoints(&self, checkpoints: &[SignedCheckpoint]) -> Result<(), CairnError> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        let mut batch = WriteBatch::default();
        for cp in checkpoints {
            batch.put_cf(cf, cp.height.to_be_bytes(), encode(cp)?);
        }
        self.db.write_opt(batch, &sync_write()).map_err(storage_err)
    }

    /// Stored checkpoints in height order.
    pub fn load_checkpoints(&self) -> Result<Vec<SignedCheckpoint>, CairnError> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(storage_err)?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Drop index entries, file infos and the transaction index ahead of a
    /// reindex. Checkpoints are kept.
    pub fn wipe_for_reindex(&self) -> Result<(), CairnError> {
        let mut batch = WriteBatch::default();
        let mut removed = 0usize;
        for name in [CF_BLOCK_INDEX, CF_BLOCK_FILES, CF_TX_INDEX] {
            let cf = self.cf_handle(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item.map_err(storage_err)?;
                batch.delete_cf(cf, key);
                removed += 1;
            }
        }
        batch.delete_cf(self.cf_handle(CF_METADATA)?, META_LAST_FILE);
        self.db.write_opt(batch, &sync_write()).map_err(storage_err)?;
        info!(removed, "block index wiped for reindex");
        Ok(())
    }
}
