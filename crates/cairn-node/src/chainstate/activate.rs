//! Moving the active chain to the best candidate, and the manual overrides
//! that reshape the candidate set.

use tracing::{debug, info, warn};

use cairn_consensus::SignedCheckpoint;
use cairn_core::constants::MAX_CONNECT_BATCH;
use cairn_core::error::{CairnError, ChainStateError};
use cairn_core::types::{Block, Hash256, Transaction};

use super::{ChainInner, Chainstate, FlushMode};
use crate::block_index::BlockId;

/// Result of one activation step.
#[derive(Debug, Default)]
struct StepOutcome {
    /// A block on the way to the target failed validation.
    invalid_found: bool,
}

impl Chainstate {
    /// Move the active chain to the best valid candidate.
    ///
    /// Works in steps: each step disconnects back to the fork point and
    /// connects blocks toward the target, looking up to [`MAX_CONNECT_BATCH`]
    /// heights ahead, until the tip has more work than before the step. The
    /// chain lock is released between steps and the shutdown flag is checked.
    /// `hint` is a block the caller holds, used instead of a disk read when
    /// it comes up for connection.
    pub fn activate_best_chain(&self, hint: Option<&Block>) -> Result<(), CairnError> {
        loop {
            if self.shutdown_requested() {
                debug!("activation interrupted by shutdown");
                break;
            }

            let mut inner = self.inner.lock();
            let tip = inner.chain.tip();
            let best = {
                let ChainInner {
                    index,
                    chain,
                    checkpoints,
                    ..
                } = &mut *inner;
                index.find_best_candidate(chain, self.enforced(checkpoints))
            };
            let Some(best) = best else { break };
            if best == tip {
                break;
            }

            let mut disconnected = Vec::new();
            match self.activate_step(&mut inner, best, hint, &mut disconnected) {
                Ok(outcome) => {
                    if !disconnected.is_empty() {
                        self.collab.mempool.reconcile_after_reorg(&disconnected, true);
                    }
                    if outcome.invalid_found {
                        let tip = inner.chain.tip();
                        inner.index.prune_candidates(tip);
                        inner.index.add_candidate(tip);
                    }
                }
                Err(e) => {
                    self.collab.mempool.reconcile_after_reorg(&disconnected, false);
                    if e.is_fatal() {
                        self.abort_node(&e);
                    }
                    return Err(e);
                }
            }

            let ibd = self.update_ibd(&inner);
            self.check_fork_warning(&mut inner, ibd);
        }

        let mut inner = self.inner.lock();
        self.maybe_check_consistency(&inner)?;
        if let Err(e) = self.flush_state_locked(&mut inner, FlushMode::Periodic) {
            self.abort_node(&e);
            return Err(e);
        }
        Ok(())
    }

    fn activate_step(
        &self,
        inner: &mut ChainInner,
        target: BlockId,
        hint: Option<&Block>,
        disconnected: &mut Vec<Transaction>,
    ) -> Result<StepOutcome, CairnError> {
        let old_tip = inner.chain.tip();
        let old_work = inner.index.get(old_tip).chain_work;
        let fork = inner.chain.find_fork(&inner.index, target);

        while inner.chain.tip() != fork {
            self.disconnect_tip(inner, disconnected)?;
        }
        if inner.chain.tip() != old_tip {
            info!(
                from = %inner.index.get(old_tip).hash,
                fork = %inner.index.get(fork).hash,
                to = %inner.index.get(target).hash,
                "reorganizing"
            );
        }

        let target_height = inner.index.get(target).height;
        let mut height = inner.index.get(fork).height;
        let mut outcome = StepOutcome::default();

        'batches: while height < target_height {
            let batch_end = (height + MAX_CONNECT_BATCH).min(target_height);
            let batch: Vec<BlockId> = (height + 1..=batch_end)
                .filter_map(|h| inner.index.ancestor(target, h))
                .collect();
            height = batch_end;

            for id in batch {
                let block = hint.filter(|b| b.hash() == inner.index.get(id).hash);
                match self.connect_tip(inner, id, block) {
                    Ok(()) => {
                        let tip = inner.chain.tip();
                        inner.index.prune_candidates(tip);
                        inner.index.add_candidate(tip);
                        if inner.index.get(tip).chain_work > old_work {
                            break 'batches;
                        }
                    }
                    Err(e) if e.is_invalid() => {
                        warn!(error = %e, "invalid block during activation");
                        outcome.invalid_found = true;
                        break 'batches;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Manual overrides
    // ------------------------------------------------------------------

    /// Mark `hash` invalid, disconnect it if active, and activate the best
    /// remaining chain.
    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), CairnError> {
        {
            let mut inner = self.inner.lock();
            let id = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            if inner.index.get(id).parent.is_none() {
                return Err(ChainStateError::InvalidateGenesis.into());
            }

            let mut disconnected = Vec::new();
            while inner.chain.contains(&inner.index, id) {
                if let Err(e) = self.disconnect_tip(&mut inner, &mut disconnected) {
                    self.collab.mempool.reconcile_after_reorg(&disconnected, false);
                    self.abort_node(&e);
                    return Err(e);
                }
            }
            let tip = inner.chain.tip();
            inner.index.invalidate(id, tip);
            inner.index.add_candidate(tip);
            self.collab.mempool.reconcile_after_reorg(&disconnected, true);
            info!(%hash, "block invalidated");
        }
        self.activate_best_chain(None)
    }

    /// Clear failure marks on `hash`, its ancestors and descendants, and
    /// activate the best chain.
    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), CairnError> {
        {
            let mut inner = self.inner.lock();
            let id = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            let tip = inner.chain.tip();
            inner.index.reset_failure_flags(id, tip);
            info!(%hash, "block reconsidered");
        }
        self.activate_best_chain(None)
    }

    /// Prefer `hash` over other blocks of equal work.
    ///
    /// Returns `false` without changing anything when the block has less
    /// work than the active tip.
    pub fn precious_block(&self, hash: &Hash256) -> Result<bool, CairnError> {
        let changed = {
            let mut inner = self.inner.lock();
            let id = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainStateError::BlockNotFound(hash.to_string()))?;
            let tip = inner.chain.tip();
            inner.index.mark_precious(id, tip)
        };
        if changed {
            self.activate_best_chain(None)?;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Verify and store new checkpoints, then move off any active branch
    /// they rule out. Returns how many were new.
    pub fn add_checkpoints(&self, checkpoints: &[SignedCheckpoint]) -> Result<usize, CairnError> {
        let added = {
            let mut inner = self.inner.lock();
            let added = inner
                .checkpoints
                .add_verified(checkpoints, self.params.checkpoint_key.as_ref())?;
            self.index_db.put_checkpoints(&added)?;
            added.len()
        };
        if added > 0 {
            info!(added, "checkpoints added");
            self.check_active_chain()?;
        }
        Ok(added)
    }

    /// Invalidate the first active block that conflicts with a checkpoint.
    pub fn check_active_chain(&self) -> Result<(), CairnError> {
        if !self.config.checkpoints {
            return Ok(());
        }
        let first_bad = {
            let inner = self.inner.lock();
            let tip = inner.chain.tip();
            inner
                .index
                .checkpoint_violation(tip, &inner.checkpoints)
                .map(|v| (v.height, inner.index.get(v.first_bad).hash))
        };
        match first_bad {
            Some((pin, hash)) => {
                warn!(pin, %hash, "active chain conflicts with checkpoint");
                self.invalidate_block(&hash)
            }
            None => self.activate_best_chain(None),
        }
    }
}
