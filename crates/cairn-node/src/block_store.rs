//! Append-only flat files for block bodies and undo records.
//!
//! Blocks go to `blk{NNNNN}.dat`, undo records to the matching
//! `rev{NNNNN}.dat`. Every record is framed as
//!
//! ```text
//! magic (4) | payload length (u32 LE) | payload [| checksum (32), undo only]
//! ```
//!
//! A [`DiskPos`] points at the first payload byte. The undo checksum is
//! `sha256d(parent block hash || payload)`, so an undo record read back for
//! the wrong block fails to verify.
//!
//! Files grow in preallocated chunks. When the current block file cannot fit
//! another record it is finalized (truncated to its used size and synced) and
//! the next file number is opened. Position allocation is serialized by one
//! lock; writes and reads happen outside it.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::types::{Block, BlockUndo, Hash256};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Bytes in front of every payload: magic plus length.
pub const RECORD_HEADER_LEN: u64 = 8;

/// Bytes after every undo payload.
pub const UNDO_CHECKSUM_LEN: u64 = 32;

/// Location of a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, bincode::Encode, bincode::Decode)]
pub struct DiskPos {
    pub file: u32,
    pub offset: u64,
}

/// Per-file statistics, persisted in the block index database.
#[derive(Debug, Clone, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockFileInfo {
    pub blocks: u32,
    /// Used bytes in the block file.
    pub size: u64,
    /// Used bytes in the undo file.
    pub undo_size: u64,
    pub height_first: u64,
    pub height_last: u64,
    pub time_first: u64,
    pub time_last: u64,
}

impl BlockFileInfo {
    fn add_block(&mut self, height: u64, time: u64) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }
}

struct FileState {
    infos: Vec<BlockFileInfo>,
    last_file: u32,
    dirty: BTreeSet<u32>,
}

impl FileState {
    fn info_mut(&mut self, file: u32) -> &mut BlockFileInfo {
        let idx = file as usize;
        if self.infos.len() <= idx {
            self.infos.resize(idx + 1, BlockFileInfo::default());
        }
        &mut self.infos[idx]
    }
}

/// Sizes that drive file rotation and preallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimits {
    pub max_file_size: u64,
    pub block_chunk: u64,
    pub undo_chunk: u64,
}

/// Flat-file store for block bodies and undo records.
pub struct BlockStore {
    dir: PathBuf,
    magic: [u8; 4],
    limits: FileLimits,
    state: Mutex<FileState>,
}

fn block_file_name(file: u32) -> String {
    format!("blk{file:05}.dat")
}

fn undo_file_name(file: u32) -> String {
    format!("rev{file:05}.dat")
}

fn file_err(path: &Path, e: impl std::fmt::Display) -> CairnError {
    CairnError::BlockFile(format!("{}: {e}", path.display()))
}

impl BlockStore {
    /// Open the store in `dir` with file infos loaded from the index.
    pub fn open(
        dir: impl AsRef<Path>,
        magic: [u8; 4],
        limits: FileLimits,
        infos: Vec<BlockFileInfo>,
        last_file: u32,
    ) -> Result<Self, CairnError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| file_err(&dir, e))?;
        debug!(dir = %dir.display(), files = infos.len(), last_file, "block store opened");
        Ok(Self {
            dir,
            magic,
            limits,
            state: Mutex::new(FileState {
                infos,
                last_file,
                dirty: BTreeSet::new(),
            }),
        })
    }

    pub fn block_path(&self, file: u32) -> PathBuf {
        self.dir.join(block_file_name(file))
    }

    pub fn undo_path(&self, file: u32) -> PathBuf {
        self.dir.join(undo_file_name(file))
    }

    pub fn last_file(&self) -> u32 {
        self.state.lock().last_file
    }

    pub fn file_info(&self, file: u32) -> Option<BlockFileInfo> {
        self.state.lock().infos.get(file as usize).cloned()
    }

    /// Grow `path` to hold `new_size` bytes, in whole chunks.
    fn preallocate(path: &Path, new_size: u64, chunk: u64) -> Result<(), CairnError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| file_err(path, e))?;
        let current = file.metadata().map_err(|e| file_err(path, e))?.len();
        if current < new_size {
            let chunk = chunk.max(1);
            let target = new_size.div_ceil(chunk) * chunk;
            file.set_len(target).map_err(|e| file_err(path, e))?;
        }
        Ok(())
    }

    /// Truncate both files of `file` to their used size and sync them.
    fn finalize_file(&self, state: &FileState, file: u32) -> Result<(), CairnError> {
        let Some(info) = state.infos.get(file as usize) else {
            return Ok(());
        };
        for (path, used) in [
            (self.block_path(file), info.size),
            (self.undo_path(file), info.undo_size),
        ] {
            if !path.exists() {
                continue;
            }
            let f = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| file_err(&path, e))?;
            f.set_len(used).map_err(|e| file_err(&path, e))?;
            f.sync_all().map_err(|e| file_err(&path, e))?;
        }
        Ok(())
    }

    /// Reserve room for a block payload of `size` bytes.
    ///
    /// With `known`, the block is already on disk there (reindexing) and
    /// only the file infos are updated.
    pub fn find_or_extend_position(
        &self,
        height: u64,
        time: u64,
        size: u64,
        known: Option<DiskPos>,
    ) -> Result<DiskPos, CairnError> {
        let mut state = self.state.lock();

        if let Some(pos) = known {
            state.last_file = state.last_file.max(pos.file);
            let info = state.info_mut(pos.file);
            info.add_block(height, time);
            info.size = info.size.max(pos.offset + size);
            state.dirty.insert(pos.file);
            return Ok(pos);
        }

        let record = RECORD_HEADER_LEN + size;
        let mut file = state.last_file;
        loop {
            let used = state.info_mut(file).size;
            if used == 0 || used + record <= self.limits.max_file_size {
                break;
            }
            file += 1;
        }

        if file != state.last_file {
            let old = state.last_file;
            if let Some(info) = state.infos.get(old as usize) {
                info!(
                    file = old,
                    blocks = info.blocks,
                    size = info.size,
                    heights = %format!("{}..={}", info.height_first, info.height_last),
                    "leaving block file"
                );
            }
            self.finalize_file(&state, old)?;
            state.last_file = file;
        }

        let info = state.info_mut(file);
        let offset = info.size + RECORD_HEADER_LEN;
        info.size += record;
        info.add_block(height, time);
        let new_size = info.size;
        state.dirty.insert(file);

        Self::preallocate(&self.block_path(file), new_size, self.limits.block_chunk)?;
        Ok(DiskPos { file, offset })
    }

    /// Reserve room in undo file `file` for a payload of `size` bytes.
    pub fn find_undo_position(&self, file: u32, size: u64) -> Result<DiskPos, CairnError> {
        let mut state = self.state.lock();
        let info = state.info_mut(file);
        let offset = info.undo_size + RECORD_HEADER_LEN;
        info.undo_size += RECORD_HEADER_LEN + size + UNDO_CHECKSUM_LEN;
        let new_size = info.undo_size;
        state.dirty.insert(file);
        Self::preallocate(&self.undo_path(file), new_size, self.limits.undo_chunk)?;
        Ok(DiskPos { file, offset })
    }

    fn write_record(&self, path: &Path, pos: DiskPos, payload: &[u8], trailer: &[u8]) -> Result<(), CairnError> {
        let len = u32::try_from(payload.len()).map_err(|_| file_err(path, "record too large"))?;
        let mut f = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| file_err(path, e))?;
        f.seek(SeekFrom::Start(pos.offset - RECORD_HEADER_LEN))
            .map_err(|e| file_err(path, e))?;
        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + payload.len() + trailer.len());
        buf.extend_from_slice(&self.magic);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(payload);
        buf.extend_from_slice(trailer);
        f.write_all(&buf).map_err(|e| file_err(path, e))
    }

    /// Read the payload at `pos`, plus `trailer_len` bytes after it.
    fn read_record(&self, path: &Path, pos: DiskPos, trailer_len: u64) -> Result<(Vec<u8>, Vec<u8>), CairnError> {
        if pos.offset < RECORD_HEADER_LEN {
            return Err(file_err(path, format!("bad offset {}", pos.offset)));
        }
        let mut f = File::open(path).map_err(|e| file_err(path, e))?;
        f.seek(SeekFrom::Start(pos.offset - RECORD_HEADER_LEN))
            .map_err(|e| file_err(path, e))?;
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        f.read_exact(&mut header).map_err(|e| file_err(path, e))?;
        if header[..4] != self.magic {
            return Err(file_err(path, format!("bad magic at offset {}", pos.offset)));
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let file_len = f.metadata().map_err(|e| file_err(path, e))?.len();
        if pos.offset + len + trailer_len > file_len {
            return Err(file_err(
                path,
                format!("record length {len} at offset {} runs past end of file", pos.offset),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        f.read_exact(&mut payload).map_err(|e| file_err(path, e))?;
        let mut trailer = vec![0u8; trailer_len as usize];
        f.read_exact(&mut trailer).map_err(|e| file_err(path, e))?;
        Ok((payload, trailer))
    }

    /// Append a block, or register it at `known` without writing.
    pub fn write_block(
        &self,
        block: &Block,
        height: u64,
        known: Option<DiskPos>,
    ) -> Result<DiskPos, CairnError> {
        let payload = bincode::encode_to_vec(block, bincode::config::standard())
            .map_err(|e| CairnError::BlockFile(e.to_string()))?;
        let pos = self.find_or_extend_position(
            height,
            block.header.timestamp,
            payload.len() as u64,
            known,
        )?;
        if known.is_none() {
            self.write_record(&self.block_path(pos.file), pos, &payload, &[])?;
        }
        Ok(pos)
    }

    pub fn read_block(&self, pos: DiskPos) -> Result<Block, CairnError> {
        let path = self.block_path(pos.file);
        let (payload, _) = self.read_record(&path, pos, 0)?;
        let (block, _): (Block, usize) =
            bincode::decode_from_slice(&payload, bincode::config::standard())
                .map_err(|e| file_err(&path, e))?;
        Ok(block)
    }

    /// Append the undo record of a block stored in `file`.
    pub fn write_undo(&self, undo: &BlockUndo, parent: &Hash256, file: u32) -> Result<DiskPos, CairnError> {
        let payload = bincode::encode_to_vec(undo, bincode::config::standard())
            .map_err(|e| CairnError::BlockFile(e.to_string()))?;
        let checksum = undo_checksum(parent, &payload);
        let pos = self.find_undo_position(file, payload.len() as u64)?;
        self.write_record(&self.undo_path(file), pos, &payload, checksum.as_bytes())?;
        Ok(pos)
    }

    /// Read an undo record and verify it belongs to a child of `parent`.
    pub fn read_undo(&self, pos: DiskPos, parent: &Hash256) -> Result<BlockUndo, CairnError> {
        let path = self.undo_path(pos.file);
        let (payload, trailer) = self.read_record(&path, pos, UNDO_CHECKSUM_LEN)?;
        if undo_checksum(parent, &payload).as_bytes()[..] != trailer[..] {
            return Err(ChainStateError::UndoChecksumMismatch(format!(
                "{} at {}:{}",
                parent, pos.file, pos.offset
            ))
            .into());
        }
        let (undo, _): (BlockUndo, usize) =
            bincode::decode_from_slice(&payload, bincode::config::standard())
                .map_err(|e| file_err(&path, e))?;
        Ok(undo)
    }

    /// Sync the current files; with `finalize`, also truncate them.
    pub fn flush(&self, finalize: bool) -> Result<(), CairnError> {
        let state = self.state.lock();
        let file = state.last_file;
        if finalize {
            return self.finalize_file(&state, file);
        }
        for path in [self.block_path(file), self.undo_path(file)] {
            if path.exists() {
                let f = OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .map_err(|e| file_err(&path, e))?;
                f.sync_all().map_err(|e| file_err(&path, e))?;
            }
        }
        Ok(())
    }

    /// Infos changed since the last call, and the current last file.
    pub fn take_dirty_infos(&self) -> (Vec<(u32, BlockFileInfo)>, u32) {
        let mut state = self.state.lock();
        let dirty = std::mem::take(&mut state.dirty);
        let infos = dirty
            .into_iter()
            .filter_map(|f| state.infos.get(f as usize).map(|i| (f, i.clone())))
            .collect();
        (infos, state.last_file)
    }

    /// Forget every file info. Files on disk are left alone.
    pub fn reset_infos(&self) {
        let mut state = self.state.lock();
        state.infos.clear();
        state.last_file = 0;
        state.dirty.clear();
    }

    /// Every block record in file `file`, in file order.
    pub fn scan_file(&self, file: u32) -> Result<Vec<(DiskPos, Block)>, CairnError> {
        let path = self.block_path(file);
        scan_records(&path, self.magic)?
            .into_iter()
            .map(|(offset, payload)| {
                let (block, _): (Block, usize) =
                    bincode::decode_from_slice(&payload, bincode::config::standard())
                        .map_err(|e| file_err(&path, e))?;
                Ok((DiskPos { file, offset }, block))
            })
            .collect()
    }
}

fn undo_checksum(parent: &Hash256, payload: &[u8]) -> Hash256 {
    let mut data = Vec::with_capacity(32 + payload.len());
    data.extend_from_slice(parent.as_bytes());
    data.extend_from_slice(payload);
    Hash256::sha256d(&data)
}

/// Walk a flat file and return `(payload offset, payload)` for every framed
/// record. Garbage between records is skipped by searching for the next
/// magic; a truncated final record ends the scan.
pub fn scan_records(path: &Path, magic: [u8; 4]) -> Result<Vec<(u64, Vec<u8>)>, CairnError> {
    let bytes = fs::read(path).map_err(|e| file_err(path, e))?;
    let header = RECORD_HEADER_LEN as usize;
    let mut records = Vec::new();
    let mut at = 0usize;
    while at + header <= bytes.len() {
        if bytes[at..at + 4] != magic {
            match bytes[at + 1..].windows(4).position(|w| w == magic) {
                Some(skip) => {
                    at += 1 + skip;
                    continue;
                }
                None => break,
            }
        }
        let len = u32::from_le_bytes([bytes[at + 4], bytes[at + 5], bytes[at + 6], bytes[at + 7]]) as usize;
        let start = at + header;
        if start + len > bytes.len() {
            break;
        }
        records.push((start as u64, bytes[start..start + len].to_vec()));
        at = start + len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::constants::NetworkType;
    use cairn_core::genesis::genesis_block;
    use cairn_core::types::{Coin, TxOutput, TxUndo};

    const MAGIC: [u8; 4] = *b"TEST";

    fn limits(max: u64) -> FileLimits {
        FileLimits {
            max_file_size: max,
            block_chunk: 4096,
            undo_chunk: 1024,
        }
    }

    fn temp_store(max: u64) -> (BlockStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlockStore::open(dir.path().join("blocks"), MAGIC, limits(max), Vec::new(), 0).unwrap();
        (store, dir)
    }

    fn sample_undo() -> BlockUndo {
        BlockUndo {
            txs: vec![TxUndo {
                prev_coins: vec![Coin::new(
                    TxOutput {
                        value: 42,
                        script_pubkey: vec![7; 32],
                    },
                    3,
                    false,
                )],
            }],
        }
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    #[test]
    fn block_round_trip() {
        let (store, _dir) = temp_store(1 << 20);
        let block = genesis_block(NetworkType::Regtest);
        let pos = store.write_block(block, 0, None).unwrap();
        assert_eq!(pos, DiskPos { file: 0, offset: RECORD_HEADER_LEN });
        assert_eq!(&store.read_block(pos).unwrap(), block);

        let info = store.file_info(0).unwrap();
        assert_eq!(info.blocks, 1);
        assert_eq!(info.height_last, 0);
    }

    #[test]
    fn file_is_preallocated_in_chunks() {
        let (store, _dir) = temp_store(1 << 20);
        store.write_block(genesis_block(NetworkType::Regtest), 0, None).unwrap();
        let len = fs::metadata(store.block_path(0)).unwrap().len();
        assert_eq!(len % 4096, 0);
        assert!(len >= store.file_info(0).unwrap().size);
    }

    #[test]
    fn rotation_finalizes_previous_file() {
        let block = genesis_block(NetworkType::Regtest);
        let one = bincode::encode_to_vec(block, bincode::config::standard()).unwrap().len() as u64
            + RECORD_HEADER_LEN;
        let (store, _dir) = temp_store(one * 2);

        let a = store.write_block(block, 0, None).unwrap();
        let b = store.write_block(block, 1, None).unwrap();
        let c = store.write_block(block, 2, None).unwrap();
        assert_eq!((a.file, b.file, c.file), (0, 0, 1));
        assert_eq!(store.last_file(), 1);

        // The finished file is exactly its used size.
        assert_eq!(fs::metadata(store.block_path(0)).unwrap().len(), one * 2);
        assert_eq!(&store.read_block(c).unwrap(), block);
    }

    #[test]
    fn oversized_block_still_fits_an_empty_file() {
        let (store, _dir) = temp_store(16);
        let block = genesis_block(NetworkType::Regtest);
        let a = store.write_block(block, 0, None).unwrap();
        let b = store.write_block(block, 1, None).unwrap();
        assert_eq!((a.file, b.file), (0, 1));
    }

    #[test]
    fn known_position_only_updates_infos() {
        let (store, _dir) = temp_store(1 << 20);
        let block = genesis_block(NetworkType::Regtest);
        let pos = store.write_block(block, 0, None).unwrap();
        store.reset_infos();

        let again = store.write_block(block, 0, Some(pos)).unwrap();
        assert_eq!(again, pos);
        let info = store.file_info(0).unwrap();
        assert_eq!(info.blocks, 1);
        assert!(info.size >= pos.offset);
        assert_eq!(&store.read_block(pos).unwrap(), block);
    }

    #[test]
    fn read_at_wrong_offset_fails() {
        let (store, _dir) = temp_store(1 << 20);
        let pos = store.write_block(genesis_block(NetworkType::Regtest), 0, None).unwrap();
        let wrong = DiskPos { offset: pos.offset + 1, ..pos };
        assert!(store.read_block(wrong).unwrap_err().is_fatal());
    }

    #[test]
    fn corrupt_length_is_an_error_not_an_allocation() {
        let (store, _dir) = temp_store(1 << 20);
        let pos = store.write_block(genesis_block(NetworkType::Regtest), 0, None).unwrap();

        let mut f = OpenOptions::new().write(true).open(store.block_path(pos.file)).unwrap();
        f.seek(SeekFrom::Start(pos.offset - 4)).unwrap();
        f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        drop(f);

        let err = store.read_block(pos).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("past end of file"));
    }

    // ------------------------------------------------------------------
    // Undo records
    // ------------------------------------------------------------------

    #[test]
    fn undo_round_trip() {
        let (store, _dir) = temp_store(1 << 20);
        let parent = Hash256([5; 32]);
        let pos = store.write_undo(&sample_undo(), &parent, 0).unwrap();
        assert_eq!(store.read_undo(pos, &parent).unwrap(), sample_undo());
        assert!(store.file_info(0).unwrap().undo_size > 0);
    }

    #[test]
    fn undo_for_wrong_parent_is_rejected() {
        let (store, _dir) = temp_store(1 << 20);
        let pos = store.write_undo(&sample_undo(), &Hash256([5; 32]), 0).unwrap();
        let err = store.read_undo(pos, &Hash256([6; 32])).unwrap_err();
        assert!(matches!(
            err,
            CairnError::ChainState(ChainStateError::UndoChecksumMismatch(_))
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn corrupted_undo_payload_is_rejected() {
        let (store, _dir) = temp_store(1 << 20);
        let parent = Hash256([5; 32]);
        let pos = store.write_undo(&sample_undo(), &parent, 0).unwrap();

        let path = store.undo_path(0);
        let mut bytes = fs::read(&path).unwrap();
        bytes[pos.offset as usize] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(store.read_undo(pos, &parent).is_err());
    }

    // ------------------------------------------------------------------
    // Infos and scanning
    // ------------------------------------------------------------------

    #[test]
    fn dirty_infos_are_taken_once() {
        let (store, _dir) = temp_store(1 << 20);
        store.write_block(genesis_block(NetworkType::Regtest), 0, None).unwrap();
        let (infos, last) = store.take_dirty_infos();
        assert_eq!(infos.len(), 1);
        assert_eq!(last, 0);
        assert!(store.take_dirty_infos().0.is_empty());
    }

    #[test]
    fn scan_skips_preallocated_tail() {
        let (store, _dir) = temp_store(1 << 20);
        let block = genesis_block(NetworkType::Regtest);
        let a = store.write_block(block, 0, None).unwrap();
        let b = store.write_block(block, 1, None).unwrap();

        let found = store.scan_file(0).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, a);
        assert_eq!(found[1].0, b);
        assert_eq!(&found[1].1, block);
    }

    #[test]
    fn scan_skips_garbage_between_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("external.dat");
        let mut bytes = vec![0xEE; 5];
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.extend_from_slice(&[9; 10]);
        fs::write(&path, bytes).unwrap();

        let records = scan_records(&path, MAGIC).unwrap();
        assert_eq!(records, vec![(13, vec![1, 2, 3])]);
    }
}
