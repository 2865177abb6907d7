//! Persisting in-memory state.
//!
//! Write order on every flush: block and undo files are synced, then the
//! block index and file infos are written in one synced batch, then the
//! coin cache. A crash between steps leaves the index ahead of the coins,
//! which startup repairs by reconnecting from the coin tip.

use std::time::{Duration, Instant};

use tracing::debug;

use cairn_core::error::CairnError;

use super::{ChainInner, Chainstate};

/// How urgently state should reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only if the coin cache is over budget.
    IfNeeded,
    /// Also on the write/flush intervals or when the cache is near budget.
    Periodic,
    /// Unconditionally.
    Always,
}

impl Chainstate {
    pub fn flush_state(&self, mode: FlushMode) -> Result<(), CairnError> {
        let mut inner = self.inner.lock();
        let res = self.flush_state_locked(&mut inner, mode);
        if let Err(e) = &res {
            self.abort_node(e);
        }
        res
    }

    pub(crate) fn flush_state_locked(
        &self,
        inner: &mut ChainInner,
        mode: FlushMode,
    ) -> Result<(), CairnError> {
        let now = Instant::now();
        let usage = inner.coins.dynamic_usage();
        let budget = self.config.coins_cache_bytes;

        let cache_large = mode == FlushMode::Periodic && usage > budget / 10 * 9;
        let cache_critical = mode == FlushMode::IfNeeded && usage > budget;
        let periodic_write = mode == FlushMode::Periodic
            && now.duration_since(inner.last_write)
                > Duration::from_secs(self.config.write_interval_secs);
        let periodic_flush = mode == FlushMode::Periodic
            && now.duration_since(inner.last_flush)
                > Duration::from_secs(self.config.flush_interval_secs);
        let full_flush =
            mode == FlushMode::Always || cache_large || cache_critical || periodic_flush;

        if full_flush || periodic_write {
            self.store.flush(false)?;
            let (infos, last_file) = self.store.take_dirty_infos();
            let entries = inner.index.take_dirty();
            self.index_db.write_batch(&infos, last_file, &entries)?;
            debug!(
                files = infos.len(),
                entries = entries.len(),
                "block index written"
            );
            inner.last_write = now;
        }

        if full_flush {
            let entries = inner.coins.cache_size();
            inner.coins.flush()?;
            debug!(entries, usage, "coin cache flushed");
            inner.last_flush = now;
        }
        Ok(())
    }
}
