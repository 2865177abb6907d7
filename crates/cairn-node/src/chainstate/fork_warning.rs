//! Large-work fork detection.

use tracing::warn;

use cairn_core::constants::{FORK_WARNING_MAX_DEPTH, FORK_WARNING_WORK_BLOCKS};
use cairn_core::difficulty::block_work;

use super::{ChainInner, Chainstate};
use crate::block_index::{BlockId, BlockIndex};

impl Chainstate {
    /// Set or clear the fork warning.
    ///
    /// A branch triggers it when its tip has at least seven blocks' worth of
    /// work more than the active tip and sits within 72 blocks of the active
    /// height. Failed branches and not-yet-connected valid branches are both
    /// considered; headers that only extend the active tip are not a fork.
    /// Nothing is evaluated during initial block download.
    pub(crate) fn check_fork_warning(&self, inner: &mut ChainInner, ibd: bool) {
        if ibd {
            return;
        }
        let tip_id = inner.chain.tip();
        let tip = inner.index.get(tip_id);
        let threshold = tip
            .chain_work
            .saturating_add(FORK_WARNING_WORK_BLOCKS * block_work(tip.header.difficulty_target));
        let tip_height = tip.height;

        let qualifies = |id: BlockId| {
            let e = inner.index.get(id);
            e.chain_work >= threshold
                && !inner.chain.contains(&inner.index, id)
                && tip_height.saturating_sub(e.height) < FORK_WARNING_MAX_DEPTH
        };

        let message = if let Some(id) = inner.index.best_invalid().filter(|&id| qualifies(id)) {
            let e = inner.index.get(id);
            Some(format!(
                "an invalid chain with more work than the active chain was found at height {} ({}); \
                 the network may not agree on consensus rules",
                e.height, e.hash
            ))
        } else if let Some(id) = best_fork(&inner.index, tip_id, &qualifies) {
            let e = inner.index.get(id);
            Some(format!(
                "a fork with substantially more work was found at height {} ({}); \
                 the active chain may be behind",
                e.height, e.hash
            ))
        } else {
            None
        };

        if message != inner.warning {
            if let Some(m) = &message {
                warn!(warning = %m, "fork warning");
            }
            inner.warning = message;
        }
    }

    /// Active warnings for display to the operator.
    pub fn warnings(&self) -> Vec<String> {
        self.inner.lock().warning.iter().cloned().collect()
    }
}

/// Highest-work qualifying entry on a branch that leaves the active chain.
/// The best header is tried first; when it merely extends the tip the whole
/// index is scanned.
fn best_fork(index: &BlockIndex, tip: BlockId, qualifies: &impl Fn(BlockId) -> bool) -> Option<BlockId> {
    let off_branch = |id: BlockId| qualifies(id) && !index.is_ancestor(tip, id);
    let best = index.best_header()?;
    if !index.is_ancestor(tip, best) {
        return Some(best).filter(|&id| off_branch(id));
    }
    index
        .ids()
        .filter(|&id| !index.get(id).is_failed() && off_branch(id))
        .max_by_key(|&id| index.get(id).chain_work)
}
