//! The chain-state driver.
//!
//! [`Chainstate`] owns the block index, the active chain, the coin cache and
//! the stores behind them. One mutex guards the in-memory state; it is held
//! for one reorg batch at a time so other callers can interleave between
//! batches. Block-file position allocation has its own lock inside
//! [`BlockStore`].
//!
//! Entry points:
//!
//! - [`Chainstate::accept_header`] / [`Chainstate::accept_block`]: grow the
//!   block tree.
//! - [`Chainstate::activate_best_chain`]: move the active chain to the best
//!   candidate.
//! - [`Chainstate::invalidate_block`], [`Chainstate::reconsider_block`],
//!   [`Chainstate::precious_block`], [`Chainstate::add_checkpoints`]: manual
//!   overrides.
//! - [`Chainstate::flush_state`]: persist according to [`FlushMode`].

mod accept;
mod activate;
mod connect;
mod flush;
mod fork_warning;

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use cairn_consensus::{CheckpointSet, Ed25519Verifier, ScriptCheckPool};
use cairn_core::coins::{CoinsView, CoinsViewCache};
use cairn_core::constants::{ChainParams, MAX_TIP_AGE};
use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::genesis::genesis_block;
use cairn_core::traits::{Clock, MempoolSink, NoopMempool, ScriptVerifier, SystemClock};
use cairn_core::types::{Block, Coin, Hash256, OutPoint, Transaction};

use crate::block_index::{BlockId, BlockIndex, Validity};
use crate::block_store::{BlockStore, DiskPos, FileLimits, RECORD_HEADER_LEN};
use crate::chain::ActiveChain;
use crate::coins_db::CoinsDb;
use crate::config::ChainstateConfig;
use crate::storage::{Flag, IndexDb, TxLocation};
use crate::utxo::{self, DisconnectResult, ReplayReport};

pub use flush::FlushMode;

/// The pluggable pieces the driver calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn ScriptVerifier>,
    pub mempool: Arc<dyn MempoolSink>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            verifier: Arc::new(Ed25519Verifier),
            mempool: Arc::new(NoopMempool),
            clock: Arc::new(SystemClock),
        }
    }
}

/// A snapshot of one block index entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u64,
    pub chain_work: u128,
    pub timestamp: u64,
    pub validity: Validity,
    pub failed: bool,
    pub has_data: bool,
    pub tx_count: u64,
    pub in_active_chain: bool,
}

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    pub height: u64,
    pub index_entries: usize,
    pub candidates: usize,
    pub blocks_connected: u64,
    pub blocks_disconnected: u64,
    pub coins_cache_bytes: usize,
    pub coins_cache_entries: usize,
}

/// State guarded by the chain lock.
pub(crate) struct ChainInner {
    pub(crate) index: BlockIndex,
    pub(crate) chain: ActiveChain,
    pub(crate) coins: CoinsViewCache<CoinsDb>,
    pub(crate) checkpoints: CheckpointSet,
    pub(crate) warning: Option<String>,
    pub(crate) last_write: Instant,
    pub(crate) last_flush: Instant,
}

impl ChainInner {
    fn info(&self, id: BlockId) -> BlockInfo {
        let e = self.index.get(id);
        BlockInfo {
            hash: e.hash,
            prev_hash: e.header.prev_hash,
            height: e.height,
            chain_work: e.chain_work,
            timestamp: e.header.timestamp,
            validity: e.validity,
            failed: e.is_failed(),
            has_data: e.has_data(),
            tx_count: e.tx_count,
            in_active_chain: self.chain.contains(&self.index, id),
        }
    }
}

pub struct Chainstate {
    inner: Mutex<ChainInner>,
    store: BlockStore,
    index_db: IndexDb,
    scripts: ScriptCheckPool,
    collab: Collaborators,
    params: ChainParams,
    config: ChainstateConfig,
    no_checkpoints: CheckpointSet,
    shutdown: AtomicBool,
    importing: AtomicBool,
    ibd_done: AtomicBool,
    blocks_connected: AtomicU64,
    blocks_disconnected: AtomicU64,
    last_replay: Option<ReplayReport>,
}

impl Chainstate {
    /// Open (or create) the chain state described by `config`.
    ///
    /// Loads the block index, makes sure genesis is stored, finishes any
    /// interrupted coin flush, and restores the active chain at the coin
    /// database's best block.
    pub fn open(config: ChainstateConfig, collab: Collaborators) -> Result<Arc<Self>, CairnError> {
        let params = ChainParams::for_network(config.network);
        fs::create_dir_all(config.blocks_dir())?;

        let index_db = IndexDb::open(config.index_path())?;
        let coins_db = CoinsDb::open(config.coins_path())?;

        let (infos, last_file) = index_db.read_file_infos()?;
        let limits = FileLimits {
            max_file_size: config.max_block_file_size,
            block_chunk: config.block_chunk_size,
            undo_chunk: config.undo_chunk_size,
        };
        let store = BlockStore::open(config.blocks_dir(), params.magic(), limits, infos, last_file)?;

        let mut index = BlockIndex::load(index_db.load_block_index()?)?;
        let checkpoints = CheckpointSet::from_verified(
            index_db
                .load_checkpoints()?
                .into_iter()
                .map(|cp| (cp.height, cp.hash)),
        );

        let reindexing = index_db.read_flag(Flag::Reindexing)?;
        if index_db.read_flag(Flag::TxIndex)? != config.txindex {
            index_db.write_flag(Flag::TxIndex, config.txindex)?;
            if config.txindex {
                warn!("transaction index enabled; blocks connected earlier are not indexed");
            }
        }

        let genesis = genesis_block(config.network);
        let genesis_hash = genesis.hash();
        let g = index.insert_genesis(genesis.header.clone());
        if !index.get(g).has_data() {
            let first = DiskPos {
                file: 0,
                offset: RECORD_HEADER_LEN,
            };
            let known = (reindexing
                && store
                    .read_block(first)
                    .is_ok_and(|b| b.hash() == genesis_hash))
            .then_some(first);
            let pos = store.write_block(genesis, 0, known)?;
            index.mark_transactions_received(g, genesis.transactions.len() as u64, pos, None);
        }

        let mut coins = CoinsViewCache::new(coins_db);
        let last_replay = utxo::replay_blocks(&index, &store, &params, &mut coins)?;

        let coins_tip = coins.best_block()?;
        let tip = if coins_tip.is_zero() {
            index.raise_validity(g, Validity::Scripts);
            coins.set_best_block(genesis_hash);
            g
        } else {
            index.lookup(&coins_tip).ok_or_else(|| {
                ChainStateError::Inconsistent(format!("coin tip {coins_tip} not in block index"))
            })?
        };

        let mut chain = ActiveChain::new(g);
        chain.set_tip(&index, tip);
        index.prefer_loaded_tip(tip);
        index.refill_candidates(tip);
        index.add_candidate(tip);

        let scripts = ScriptCheckPool::new(config.script_threads)?;
        let now = Instant::now();
        let inner = ChainInner {
            index,
            chain,
            coins,
            checkpoints,
            warning: None,
            last_write: now,
            last_flush: now,
        };

        let cs = Self {
            inner: Mutex::new(inner),
            store,
            index_db,
            scripts,
            collab,
            params,
            config,
            no_checkpoints: CheckpointSet::new(),
            shutdown: AtomicBool::new(false),
            importing: AtomicBool::new(reindexing),
            ibd_done: AtomicBool::new(false),
            blocks_connected: AtomicU64::new(0),
            blocks_disconnected: AtomicU64::new(0),
            last_replay,
        };

        {
            let inner = cs.inner.lock();
            let tip = inner.index.get(inner.chain.tip());
            info!(
                network = cs.config.network.data_dir_suffix(),
                height = tip.height,
                tip = %tip.hash,
                headers = inner.index.len(),
                script_threads = cs.scripts.threads(),
                "chain state loaded"
            );
            if cs.config.consistency_checks {
                inner.index.consistency_check(&inner.chain)?;
            }
        }
        Ok(Arc::new(cs))
    }

    /// Wipe the block index and coin database so the next
    /// [`Chainstate::open`] starts a reindex. Block files are kept, and so
    /// are stored checkpoints.
    pub fn prepare_reindex(config: &ChainstateConfig) -> Result<(), CairnError> {
        fs::create_dir_all(config.blocks_dir())?;
        let index_db = IndexDb::open(config.index_path())?;
        index_db.wipe_for_reindex()?;
        CoinsDb::open(config.coins_path())?.wipe()?;
        index_db.write_flag(Flag::Reindexing, true)?;
        info!("reindex prepared");
        Ok(())
    }

    pub(crate) fn finish_reindex(&self) -> Result<(), CairnError> {
        self.index_db.write_flag(Flag::Reindexing, false)?;
        self.importing.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn set_importing(&self, importing: bool) {
        self.importing.store(importing, Ordering::SeqCst);
    }

    pub fn is_reindexing(&self) -> Result<bool, CairnError> {
        self.index_db.read_flag(Flag::Reindexing)
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn config(&self) -> &ChainstateConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &BlockStore {
        &self.store
    }

    /// Checkpoints that activation and header acceptance enforce.
    fn enforced<'a>(&'a self, checkpoints: &'a CheckpointSet) -> &'a CheckpointSet {
        if self.config.checkpoints {
            checkpoints
        } else {
            &self.no_checkpoints
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn active_tip(&self) -> BlockInfo {
        let inner = self.inner.lock();
        inner.info(inner.chain.tip())
    }

    pub fn active_height(&self) -> u64 {
        self.inner.lock().chain.height()
    }

    /// Hash of the active-chain block at `height`.
    pub fn active_hash_at(&self, height: u64) -> Option<Hash256> {
        let inner = self.inner.lock();
        inner.chain.at(height).map(|id| inner.index.get(id).hash)
    }

    pub fn block_index_lookup(&self, hash: &Hash256) -> Option<BlockInfo> {
        let inner = self.inner.lock();
        inner.index.lookup(hash).map(|id| inner.info(id))
    }

    /// The header with the most work, valid or not yet checked.
    pub fn best_header(&self) -> Option<BlockInfo> {
        let inner = self.inner.lock();
        inner.index.best_header().map(|id| inner.info(id))
    }

    /// The block activation would move to next.
    pub fn best_candidate(&self) -> Option<BlockInfo> {
        let mut inner = self.inner.lock();
        let ChainInner {
            index,
            chain,
            checkpoints,
            ..
        } = &mut *inner;
        let best = index.find_best_candidate(chain, self.enforced(checkpoints))?;
        Some(inner.info(best))
    }

    /// The newest locator entry that is on the active chain, or genesis.
    pub fn find_fork_point(&self, locator: &[Hash256]) -> BlockInfo {
        let inner = self.inner.lock();
        let tip = inner.chain.tip();
        for hash in locator {
            let Some(id) = inner.index.lookup(hash) else {
                continue;
            };
            if inner.chain.contains(&inner.index, id) {
                return inner.info(id);
            }
            if inner.index.ancestor(id, inner.chain.height()) == Some(tip) {
                return inner.info(tip);
            }
        }
        inner.info(inner.chain.genesis())
    }

    pub fn block_locator(&self) -> Vec<Hash256> {
        let inner = self.inner.lock();
        inner.chain.locator(&inner.index, inner.chain.tip())
    }

    /// Read a stored block body.
    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, CairnError> {
        let pos = {
            let inner = self.inner.lock();
            inner
                .index
                .lookup(hash)
                .and_then(|id| inner.index.get(id).data_pos)
        };
        pos.map(|p| self.store.read_block(p)).transpose()
    }

    /// An unspent coin as of the active tip.
    pub fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, CairnError> {
        self.inner.lock().coins.get_coin(outpoint)
    }

    /// The coin database's head-blocks record.
    pub fn coins_head_blocks(&self) -> Result<Vec<Hash256>, CairnError> {
        self.inner.lock().coins.base().head_blocks()
    }

    /// What the startup replay did, if one ran.
    pub fn last_replay(&self) -> Option<ReplayReport> {
        self.last_replay
    }

    pub fn stats(&self) -> ChainStats {
        let inner = self.inner.lock();
        ChainStats {
            height: inner.chain.height(),
            index_entries: inner.index.len(),
            candidates: inner.index.candidates().count(),
            blocks_connected: self.blocks_connected.load(Ordering::Relaxed),
            blocks_disconnected: self.blocks_disconnected.load(Ordering::Relaxed),
            coins_cache_bytes: inner.coins.dynamic_usage(),
            coins_cache_entries: inner.coins.cache_size(),
        }
    }

    /// Run the full block-index consistency check now.
    pub fn check_consistency(&self) -> Result<(), CairnError> {
        let inner = self.inner.lock();
        inner.index.consistency_check(&inner.chain)
    }

    fn maybe_check_consistency(&self, inner: &ChainInner) -> Result<(), CairnError> {
        if self.config.consistency_checks {
            inner.index.consistency_check(&inner.chain)?;
        }
        Ok(())
    }

    /// Where a confirmed transaction is stored. Requires `txindex`.
    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, CairnError> {
        if !self.config.txindex {
            return Ok(None);
        }
        self.index_db.read_tx_index(txid)
    }

    /// A confirmed transaction by txid. Requires `txindex`.
    pub fn get_transaction(&self, txid: &Hash256) -> Result<Option<Transaction>, CairnError> {
        let Some(loc) = self.tx_location(txid)? else {
            return Ok(None);
        };
        let block = self.store.read_block(loc.block_pos)?;
        Ok(block.transactions.into_iter().nth(loc.tx_index as usize))
    }

    // ------------------------------------------------------------------
    // Initial block download
    // ------------------------------------------------------------------

    /// Whether the node is still catching up. Once this returns `false` it
    /// stays `false`.
    pub fn is_initial_block_download(&self) -> bool {
        if self.ibd_done.load(Ordering::Relaxed) {
            return false;
        }
        let inner = self.inner.lock();
        self.update_ibd(&inner)
    }

    pub(crate) fn update_ibd(&self, inner: &ChainInner) -> bool {
        if self.ibd_done.load(Ordering::Relaxed) {
            return false;
        }
        if self.importing.load(Ordering::Relaxed) {
            return true;
        }
        let tip = inner.index.get(inner.chain.tip());
        if tip.chain_work < self.params.min_chain_work {
            return true;
        }
        if tip.header.timestamp.saturating_add(MAX_TIP_AGE) < self.collab.clock.now() {
            return true;
        }
        info!(height = tip.height, "leaving initial block download");
        self.ibd_done.store(true, Ordering::Relaxed);
        false
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Read back the top `depth` blocks of the active chain with their undo
    /// records and disconnect them on a scratch view. Returns how many
    /// blocks were checked.
    pub fn verify_recent_blocks(&self, depth: u64) -> Result<u64, CairnError> {
        let inner = self.inner.lock();
        let mut view = CoinsViewCache::new(&inner.coins);
        let mut cur = inner.chain.tip();
        let mut checked = 0;
        while checked < depth {
            if self.shutdown_requested() {
                break;
            }
            let entry = inner.index.get(cur);
            let Some(parent) = entry.parent else { break };
            let pos = entry
                .data_pos
                .ok_or_else(|| ChainStateError::BlockDataMissing(entry.hash.to_string()))?;
            let block = self.store.read_block(pos)?;
            if block.hash() != entry.hash {
                return Err(ChainStateError::Inconsistent(format!(
                    "block at {}:{} is not {}",
                    pos.file, pos.offset, entry.hash
                ))
                .into());
            }
            match utxo::disconnect_block(&self.store, &self.params, &block, entry, &mut view)? {
                DisconnectResult::Failed => {
                    return Err(ChainStateError::DisconnectFailed(entry.hash.to_string()).into());
                }
                DisconnectResult::Unclean => {
                    return Err(ChainStateError::Inconsistent(format!(
                        "coin set does not match block {}",
                        entry.hash
                    ))
                    .into());
                }
                DisconnectResult::Ok => {}
            }
            checked += 1;
            cur = parent;
        }
        info!(checked, "recent blocks verified");
        Ok(checked)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("shutdown requested");
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Log a fatal error and stop further chain work.
    pub(crate) fn abort_node(&self, err: &CairnError) {
        error!(error = %err, "fatal chain state error, shutting down");
        self.request_shutdown();
    }

    fn record_connected(&self) {
        self.blocks_connected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_disconnected(&self) {
        self.blocks_disconnected.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Chainstate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chainstate")
            .field("network", &self.config.network)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}
