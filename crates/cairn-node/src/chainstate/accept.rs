//! Header and block acceptance.

use tracing::{debug, warn};

use cairn_core::block_validation::{
    check_block, check_block_header, contextual_check_block, contextual_check_block_header,
    HeaderContext,
};
use cairn_core::constants::MIN_BLOCKS_TO_KEEP;
use cairn_core::error::CairnError;
use cairn_core::types::{Block, BlockHeader};

use super::{BlockInfo, ChainInner, Chainstate};
use crate::block_index::BlockId;
use crate::block_store::DiskPos;

impl Chainstate {
    /// Validate a header and add it to the block index.
    ///
    /// Known headers are returned without rechecking, unless they are marked
    /// failed. An unknown parent is a missing-data error.
    pub fn accept_header(&self, header: &BlockHeader) -> Result<BlockInfo, CairnError> {
        let mut inner = self.inner.lock();
        let id = self.accept_header_locked(&mut inner, header)?;
        Ok(inner.info(id))
    }

    pub(crate) fn accept_header_locked(
        &self,
        inner: &mut ChainInner,
        header: &BlockHeader,
    ) -> Result<BlockId, CairnError> {
        let hash = header.hash();
        if inner.index.lookup(&hash).is_none() {
            check_block_header(header, self.params.pow_limit)?;
        }
        let params = &self.params;
        let now = self.collab.clock.now();
        let checkpoints = self.enforced(&inner.checkpoints);
        inner.index.register_header(header, |index, parent| {
            let ctx = HeaderContext {
                height: index.get(parent).height + 1,
                median_time_past: index.median_time_past(parent),
                expected_target: index.next_target(parent, params),
            };
            contextual_check_block_header(header, &ctx, params, now)?;
            index.check_header_checkpoints(ctx.height, &hash, checkpoints)?;
            Ok(())
        })
    }

    /// Store a block body after validating it.
    ///
    /// Returns `Ok(false)` when the block was silently skipped: already
    /// stored, or unrequested and not worth processing (no more work than
    /// the tip, too far ahead of it, or below the minimum chain work).
    /// `known` is the block's existing position when reindexing.
    pub fn accept_block(
        &self,
        block: &Block,
        requested: bool,
        known: Option<DiskPos>,
    ) -> Result<bool, CairnError> {
        let mut inner = self.inner.lock();
        let res = self.accept_block_locked(&mut inner, block, requested, known);
        if let Err(e) = &res {
            if e.is_fatal() {
                self.abort_node(e);
            }
        }
        let res = res?;
        self.maybe_check_consistency(&inner)?;
        Ok(res)
    }

    pub(crate) fn accept_block_locked(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        requested: bool,
        known: Option<DiskPos>,
    ) -> Result<bool, CairnError> {
        let id = self.accept_header_locked(inner, &block.header)?;
        let tip = inner.chain.tip();
        let entry = inner.index.get(id);
        let tip_entry = inner.index.get(tip);

        if entry.has_data() {
            return Ok(false);
        }
        if !requested {
            let more_work = entry.chain_work > tip_entry.chain_work;
            let too_far_ahead = entry.height > tip_entry.height + MIN_BLOCKS_TO_KEEP;
            if !more_work || too_far_ahead || entry.chain_work < self.params.min_chain_work {
                debug!(hash = %entry.hash, height = entry.height, "skipping unrequested block");
                return Ok(false);
            }
        }

        let height = entry.height;
        let parent_mtp = entry
            .parent
            .map_or(0, |p| inner.index.median_time_past(p));
        let checked = check_block(block, self.params.pow_limit)
            .and_then(|()| contextual_check_block(block, height, parent_mtp, &self.params));
        if let Err(e) = checked {
            if !e.is_mutation() {
                inner.index.mark_failed(id);
            }
            warn!(hash = %inner.index.get(id).hash, height, error = %e, "block rejected");
            return Err(e.into());
        }

        let pos = self.store.write_block(block, height, known)?;
        inner
            .index
            .mark_transactions_received(id, block.transactions.len() as u64, pos, Some(tip));
        debug!(
            hash = %inner.index.get(id).hash,
            height,
            file = pos.file,
            offset = pos.offset,
            "block stored"
        );
        Ok(true)
    }

    /// Accept a block and activate the best chain.
    ///
    /// Returns whether the block was newly stored.
    pub fn process_new_block(&self, block: &Block, requested: bool) -> Result<bool, CairnError> {
        let stored = self.accept_block(block, requested, None)?;
        self.activate_best_chain(Some(block))?;
        Ok(stored)
    }
}
