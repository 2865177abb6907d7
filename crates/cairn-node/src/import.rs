//! Bulk loading of blocks from flat files.
//!
//! Two sources feed the same path: the node's own `blkNNNNN.dat` files
//! during a reindex, where every block keeps its existing position, and
//! external bootstrap files in the same record format, which are copied into
//! the block store. Blocks that arrive before their parent wait in a map
//! keyed by the missing parent and are accepted breadth-first once it lands.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::types::{Block, Hash256};

use crate::block_store::{scan_records, DiskPos};
use crate::chainstate::Chainstate;

/// Where imported blocks come from.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// Rebuild the index and coins from the node's own block files.
    Reindex,
    /// Load external bootstrap files.
    Files(Vec<PathBuf>),
}

/// Totals for one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub files: usize,
    pub blocks_read: u64,
    pub blocks_accepted: u64,
    pub blocks_invalid: u64,
    /// Blocks whose parent never showed up.
    pub orphans: u64,
    pub interrupted: bool,
}

/// Blocks waiting on an unknown parent.
#[derive(Default)]
struct Deferred {
    by_parent: HashMap<Hash256, Vec<(Option<DiskPos>, Block)>>,
}

impl Deferred {
    fn push(&mut self, pos: Option<DiskPos>, block: Block) {
        self.by_parent
            .entry(block.header.prev_hash)
            .or_default()
            .push((pos, block));
    }

    fn len(&self) -> u64 {
        self.by_parent.values().map(|v| v.len() as u64).sum()
    }
}

/// Run an import to completion or until shutdown is requested.
pub fn run_import(chainstate: &Chainstate, source: ImportSource) -> Result<ImportReport, CairnError> {
    let reindex = matches!(source, ImportSource::Reindex);
    chainstate.set_importing(true);
    let res = import_inner(chainstate, source);
    // A failed or interrupted reindex leaves the persisted flag set.
    chainstate.set_importing(false);
    if reindex && res.as_ref().is_ok_and(|r| !r.interrupted) {
        chainstate.finish_reindex()?;
    }
    let report = res?;

    info!(
        files = report.files,
        read = report.blocks_read,
        accepted = report.blocks_accepted,
        invalid = report.blocks_invalid,
        orphans = report.orphans,
        interrupted = report.interrupted,
        "import finished"
    );
    Ok(report)
}

fn import_inner(chainstate: &Chainstate, source: ImportSource) -> Result<ImportReport, CairnError> {
    let mut report = ImportReport::default();
    let mut deferred = Deferred::default();

    match source {
        ImportSource::Reindex => {
            info!("reindexing block files");
            let mut file = 0u32;
            loop {
                if !chainstate.store().block_path(file).exists() {
                    break;
                }
                let blocks = chainstate.store().scan_file(file)?;
                debug!(file, blocks = blocks.len(), "scanning block file");
                let records = blocks.into_iter().map(|(pos, b)| (Some(pos), b));
                if !import_records(chainstate, records, &mut deferred, &mut report)? {
                    break;
                }
                report.files += 1;
                chainstate.activate_best_chain(None)?;
                file += 1;
            }
        }
        ImportSource::Files(paths) => {
            let magic = chainstate.params().magic();
            for path in paths {
                if chainstate.shutdown_requested() {
                    report.interrupted = true;
                    break;
                }
                info!(path = %path.display(), "importing block file");
                let blocks = read_external(&path, magic)?;
                let records = blocks.into_iter().map(|b| (None, b));
                if !import_records(chainstate, records, &mut deferred, &mut report)? {
                    break;
                }
                report.files += 1;
                chainstate.activate_best_chain(None)?;
            }
        }
    }

    report.orphans = deferred.len();
    if report.orphans > 0 {
        warn!(orphans = report.orphans, "blocks left without a parent");
    }
    if !report.interrupted {
        chainstate.activate_best_chain(None)?;
    }
    Ok(report)
}

/// Feed one file's blocks through acceptance. Returns `false` when shutdown
/// interrupted the run.
fn import_records(
    chainstate: &Chainstate,
    records: impl Iterator<Item = (Option<DiskPos>, Block)>,
    deferred: &mut Deferred,
    report: &mut ImportReport,
) -> Result<bool, CairnError> {
    for (pos, block) in records {
        if chainstate.shutdown_requested() {
            report.interrupted = true;
            return Ok(false);
        }
        report.blocks_read += 1;

        let prev = block.header.prev_hash;
        let is_genesis = block.hash() == chainstate.params().genesis_hash();
        if !is_genesis && chainstate.block_index_lookup(&prev).is_none() {
            deferred.push(pos, block);
            continue;
        }

        let hash = block.hash();
        accept_one(chainstate, pos, &block, report)?;

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for (pos, child) in deferred.by_parent.remove(&parent).unwrap_or_default() {
                let hash = child.hash();
                accept_one(chainstate, pos, &child, report)?;
                queue.push_back(hash);
            }
        }
    }
    Ok(true)
}

fn accept_one(
    chainstate: &Chainstate,
    pos: Option<DiskPos>,
    block: &Block,
    report: &mut ImportReport,
) -> Result<(), CairnError> {
    match chainstate.accept_block(block, true, pos) {
        Ok(true) => report.blocks_accepted += 1,
        Ok(false) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            report.blocks_invalid += 1;
            debug!(hash = %block.hash(), error = %e, "imported block rejected");
        }
    }
    Ok(())
}

fn read_external(path: &Path, magic: [u8; 4]) -> Result<Vec<Block>, CairnError> {
    if !path.exists() {
        return Err(ChainStateError::Inconsistent(format!(
            "import file {} does not exist",
            path.display()
        ))
        .into());
    }
    let mut blocks = Vec::new();
    for (offset, payload) in scan_records(path, magic)? {
        match bincode::decode_from_slice::<Block, _>(&payload, bincode::config::standard()) {
            Ok((block, _)) => blocks.push(block),
            Err(e) => warn!(path = %path.display(), offset, error = %e, "undecodable block record"),
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferred_counts_all_waiting_blocks() {
        let mut d = Deferred::default();
        let mut a = cairn_core::genesis::genesis_block(cairn_core::constants::NetworkType::Regtest).clone();
        a.header.prev_hash = Hash256([1; 32]);
        let mut b = a.clone();
        b.header.nonce += 1;
        let mut c = a.clone();
        c.header.prev_hash = Hash256([2; 32]);
        d.push(None, a);
        d.push(None, b);
        d.push(None, c);
        assert_eq!(d.len(), 3);
        assert_eq!(d.by_parent.len(), 2);
    }

    #[test]
    fn missing_external_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_external(&dir.path().join("nope.dat"), [0; 4]).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
