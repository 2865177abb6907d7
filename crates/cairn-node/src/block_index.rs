//! In-memory block index.
//!
//! Every header the node has accepted gets one [`BlockIndexEntry`] in an
//! arena addressed by [`BlockId`]. Parent and skip links are ids into the
//! same arena, so the tree is walked without reference counting.
//!
//! Alongside the arena the index keeps:
//!
//! - the **candidate set**: entries whose whole ancestry has bodies, that
//!   are not known invalid, and that are at least as good as the active
//!   tip. The best candidate is the next activation target.
//! - the **unlinked map**: entries whose body arrived before some
//!   ancestor's body, keyed by parent. When the missing body arrives the
//!   waiting descendants are linked in arrival order.
//! - the dirty set of entries to persist on the next flush.
//!
//! Candidate order is most work first; equal work falls back to the
//! sequence id (earlier arrival wins, negative ids come from
//! [`BlockIndex::mark_precious`]) and then to the arena id.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};

use cairn_consensus::CheckpointSet;
use cairn_core::block_validation::median_time;
use cairn_core::constants::{ChainParams, MEDIAN_TIME_SPAN};
use cairn_core::difficulty::{block_work, target_for_height};
use cairn_core::error::{BlockError, CairnError, ChainStateError};
use cairn_core::types::{BlockHeader, Hash256};
use tracing::{debug, warn};

use crate::block_store::DiskPos;
use crate::chain::ActiveChain;
use crate::storage::DiskBlockIndex;

/// Index of an entry in the block index arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// How far an entry has been validated. Levels only ever rise, except
/// through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode)]
pub enum Validity {
    Unknown,
    /// Header is valid and its parent is known.
    Tree,
    /// Body is stored and passed context-free and contextual checks.
    Transactions,
    /// Outputs, spends and fees check out against the coin set.
    Chain,
    /// Every input script verified.
    Scripts,
}

/// Sticky failure marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum Failure {
    /// The block itself broke a consensus rule.
    Valid,
    /// Some ancestor did.
    Child,
}

pub const SEQUENCE_TIP_FROM_DISK: i64 = 0;
pub const SEQUENCE_FROM_DISK: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parent: Option<BlockId>,
    pub skip: Option<BlockId>,
    pub height: u64,
    /// Cumulative work up to and including this block.
    pub chain_work: u128,
    pub validity: Validity,
    pub failure: Option<Failure>,
    pub data_pos: Option<DiskPos>,
    pub undo_pos: Option<DiskPos>,
    /// Transactions in this block, 0 until the body arrives.
    pub tx_count: u64,
    /// Transactions in this block and all ancestors. Non-zero only once
    /// every ancestor body is stored.
    pub chain_tx_count: u64,
    /// Arrival order of the body. Entries loaded from disk share
    /// [`SEQUENCE_FROM_DISK`], except the loaded tip which gets
    /// [`SEQUENCE_TIP_FROM_DISK`].
    pub sequence: i64,
}

impl BlockIndexEntry {
    pub fn has_data(&self) -> bool {
        self.data_pos.is_some()
    }

    pub fn has_undo(&self) -> bool {
        self.undo_pos.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Not failed and validated to at least `level`.
    pub fn is_valid(&self, level: Validity) -> bool {
        !self.is_failed() && self.validity >= level
    }

    fn to_disk(&self) -> DiskBlockIndex {
        DiskBlockIndex {
            header: self.header.clone(),
            height: self.height,
            validity: self.validity,
            failure: self.failure,
            data_pos: self.data_pos,
            undo_pos: self.undo_pos,
            tx_count: self.tx_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CandidateKey {
    work: u128,
    sequence: i64,
    id: BlockId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .work
            .cmp(&self.work)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn invert_lowest_one(n: u64) -> u64 {
    n & n.wrapping_sub(1)
}

/// Height the skip pointer of an entry at `height` points to.
pub fn skip_height(height: u64) -> u64 {
    if height < 2 {
        0
    } else if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Where an entry's ancestry departs from the checkpointed history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointViolation {
    /// Pinned height that is violated.
    pub height: u64,
    /// Lowest ancestor of the entry that is off the pinned history.
    pub first_bad: BlockId,
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
    candidates: BTreeSet<CandidateKey>,
    unlinked: HashMap<BlockId, Vec<BlockId>>,
    best_header: Option<BlockId>,
    best_invalid: Option<BlockId>,
    dirty: BTreeSet<BlockId>,
    next_sequence: i64,
    precious_sequence: i64,
    last_precious_work: u128,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            next_sequence: SEQUENCE_FROM_DISK + 1,
            precious_sequence: -1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    fn get_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        self.dirty.insert(id);
        &mut self.entries[id.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.entries.len() as u32).map(BlockId)
    }

    pub fn best_header(&self) -> Option<BlockId> {
        self.best_header
    }

    pub fn best_invalid(&self) -> Option<BlockId> {
        self.best_invalid
    }

    fn key(&self, id: BlockId) -> CandidateKey {
        let e = self.get(id);
        CandidateKey {
            work: e.chain_work,
            sequence: e.sequence,
            id,
        }
    }

    /// `a` ranks strictly below `b` in candidate order.
    pub fn is_worse(&self, a: BlockId, b: BlockId) -> bool {
        self.key(a) > self.key(b)
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    fn push_entry(&mut self, header: BlockHeader, parent: Option<BlockId>) -> BlockId {
        let hash = header.hash();
        let id = BlockId(self.entries.len() as u32);
        let (height, parent_work) = match parent {
            Some(p) => (self.get(p).height + 1, self.get(p).chain_work),
            None => (0, 0),
        };
        let skip = parent.and_then(|p| self.ancestor(p, skip_height(height)));
        let chain_work = parent_work + block_work(header.difficulty_target);
        self.entries.push(BlockIndexEntry {
            hash,
            header,
            parent,
            skip,
            height,
            chain_work,
            validity: Validity::Tree,
            failure: None,
            data_pos: None,
            undo_pos: None,
            tx_count: 0,
            chain_tx_count: 0,
            sequence: 0,
        });
        self.by_hash.insert(hash, id);
        self.dirty.insert(id);
        if self
            .best_header
            .is_none_or(|b| self.get(b).chain_work < chain_work)
        {
            self.best_header = Some(id);
        }
        id
    }

    /// Insert the genesis header, or return it if already known.
    pub fn insert_genesis(&mut self, header: BlockHeader) -> BlockId {
        match self.lookup(&header.hash()) {
            Some(id) => id,
            None => self.push_entry(header, None),
        }
    }

    /// Add a header whose parent is known.
    ///
    /// Known headers are returned as-is unless they are marked failed.
    /// `check` runs the contextual rules with the parent id; if it fails
    /// nothing is inserted.
    pub fn register_header<F>(&mut self, header: &BlockHeader, check: F) -> Result<BlockId, CairnError>
    where
        F: FnOnce(&Self, BlockId) -> Result<(), CairnError>,
    {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            if self.get(id).is_failed() {
                return Err(BlockError::DuplicateInvalid(hash.to_string()).into());
            }
            return Ok(id);
        }
        let parent = self
            .lookup(&header.prev_hash)
            .ok_or_else(|| BlockError::PrevBlockNotFound(header.prev_hash.to_string()))?;
        if self.get(parent).is_failed() {
            return Err(BlockError::BadPrevBlock.into());
        }
        check(self, parent)?;
        let id = self.push_entry(header.clone(), Some(parent));
        debug!(%hash, height = self.get(id).height, "header registered");
        Ok(id)
    }

    /// Record that the body of `id` is stored at `pos`.
    ///
    /// If every ancestor body is present, `id` and any descendants waiting
    /// in the unlinked map receive their cumulative transaction counts and
    /// sequence ids (breadth first, so in arrival order) and join the
    /// candidate set when they are not worse than `tip`. Otherwise `id`
    /// waits in the unlinked map under its parent.
    pub fn mark_transactions_received(
        &mut self,
        id: BlockId,
        tx_count: u64,
        pos: DiskPos,
        tip: Option<BlockId>,
    ) {
        {
            let e = self.get_mut(id);
            e.tx_count = tx_count;
            e.chain_tx_count = 0;
            e.data_pos = Some(pos);
            if e.validity < Validity::Transactions {
                e.validity = Validity::Transactions;
            }
        }

        let parent = self.get(id).parent;
        let parent_ready = parent.is_none_or(|p| self.get(p).chain_tx_count != 0);
        if !parent_ready {
            if let Some(p) = parent {
                self.unlinked.entry(p).or_default().push(id);
            }
            return;
        }

        let mut queue = VecDeque::from([id]);
        while let Some(cur) = queue.pop_front() {
            let parent_tx = self
                .get(cur)
                .parent
                .map_or(0, |p| self.get(p).chain_tx_count);
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            {
                let e = self.get_mut(cur);
                e.chain_tx_count = parent_tx + e.tx_count;
                e.sequence = sequence;
            }
            if !self.get(cur).is_failed() && tip.is_none_or(|t| !self.is_worse(cur, t)) {
                self.candidates.insert(self.key(cur));
            }
            if let Some(children) = self.unlinked.remove(&cur) {
                queue.extend(children);
            }
        }
    }

    pub fn set_undo_pos(&mut self, id: BlockId, pos: DiskPos) {
        self.get_mut(id).undo_pos = Some(pos);
    }

    /// Raise the validity of `id` to `level`. Returns whether it changed.
    pub fn raise_validity(&mut self, id: BlockId, level: Validity) -> bool {
        if self.get(id).is_failed() || self.get(id).validity >= level {
            return false;
        }
        self.get_mut(id).validity = level;
        true
    }

    // ------------------------------------------------------------------
    // Ancestry
    // ------------------------------------------------------------------

    /// The ancestor of `id` at `height`, following skip pointers.
    pub fn ancestor(&self, id: BlockId, height: u64) -> Option<BlockId> {
        let mut walk = id;
        let mut walk_height = self.get(id).height;
        if height > walk_height {
            return None;
        }
        while walk_height > height {
            let e = self.get(walk);
            let h_skip = skip_height(walk_height);
            let h_skip_prev = skip_height(walk_height - 1);
            let take_skip = e.skip.is_some()
                && (h_skip == height
                    || (h_skip > height && !(h_skip_prev + 2 < h_skip && h_skip_prev >= height)));
            match (take_skip, e.skip, e.parent) {
                (true, Some(skip), _) => {
                    walk = skip;
                    walk_height = h_skip;
                }
                (_, _, Some(parent)) => {
                    walk = parent;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    /// Whether `ancestor` is `id` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: BlockId, id: BlockId) -> bool {
        self.ancestor(id, self.get(ancestor).height) == Some(ancestor)
    }

    pub fn last_common_ancestor(&self, a: BlockId, b: BlockId) -> Option<BlockId> {
        let height = self.get(a).height.min(self.get(b).height);
        let mut a = self.ancestor(a, height)?;
        let mut b = self.ancestor(b, height)?;
        while a != b {
            a = self.get(a).parent?;
            b = self.get(b).parent?;
        }
        Some(a)
    }

    /// Median timestamp of `id` and up to ten of its ancestors.
    pub fn median_time_past(&self, id: BlockId) -> u64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cur = Some(id);
        while let Some(c) = cur {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            times.push(self.get(c).header.timestamp);
            cur = self.get(c).parent;
        }
        times.reverse();
        median_time(&times)
    }

    /// Target required of a child of `parent`.
    pub fn next_target(&self, parent: BlockId, params: &ChainParams) -> u64 {
        if params.pow_no_retargeting {
            return params.pow_limit;
        }
        let p = self.get(parent);
        target_for_height(p.height + 1, p.header.difficulty_target, params.pow_limit, |h| {
            self.ancestor(parent, h)
                .map_or(0, |a| self.get(a).header.timestamp)
        })
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Check a new header at `height` with `hash` and parent `parent`
    /// against the pins: it must match a pin at its own height and may not
    /// fork below the newest pin whose block is known.
    pub fn check_header_checkpoints(
        &self,
        height: u64,
        hash: &Hash256,
        checkpoints: &CheckpointSet,
    ) -> Result<(), BlockError> {
        checkpoints.check(height, hash)?;
        let newest_known = checkpoints
            .iter()
            .filter(|(_, h)| self.lookup(h).is_some())
            .last();
        if let Some((pin_height, _)) = newest_known {
            if height < pin_height {
                return Err(BlockError::ForkBeforeCheckpoint { height: pin_height });
            }
        }
        Ok(())
    }

    /// The lowest point where the ancestry of `id` leaves pinned history.
    ///
    /// A pin at or below the entry's height is violated when the ancestor
    /// there has another hash. A pin above it, whose block is known, is
    /// violated when `id` is not an ancestor of the pinned block.
    pub fn checkpoint_violation(&self, id: BlockId, checkpoints: &CheckpointSet) -> Option<CheckpointViolation> {
        let height = self.get(id).height;
        let mut worst: Option<CheckpointViolation> = None;
        for (pin_height, pin_hash) in checkpoints.iter() {
            let pinned = self.lookup(&pin_hash);
            let violated = if pin_height <= height {
                self.ancestor(id, pin_height)
                    .is_some_and(|a| self.get(a).hash != pin_hash)
            } else {
                pinned.is_some_and(|p| !self.is_ancestor(id, p))
            };
            if !violated {
                continue;
            }
            let first_bad = match pinned.and_then(|p| self.last_common_ancestor(id, p)) {
                Some(fork) => self.ancestor(id, self.get(fork).height + 1),
                None => self.ancestor(id, pin_height.min(height)),
            };
            let Some(first_bad) = first_bad else { continue };
            if worst.is_none_or(|w| self.get(first_bad).height < self.get(w.first_bad).height) {
                worst = Some(CheckpointViolation {
                    height: pin_height,
                    first_bad,
                });
            }
        }
        worst
    }

    // ------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------

    pub fn is_candidate(&self, id: BlockId) -> bool {
        self.candidates.contains(&self.key(id))
    }

    pub fn candidates(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.candidates.iter().map(|k| k.id)
    }

    /// Put `id` back into the candidate set if it qualifies.
    pub fn add_candidate(&mut self, id: BlockId) {
        let e = self.get(id);
        if e.is_valid(Validity::Transactions) && e.chain_tx_count > 0 {
            self.candidates.insert(self.key(id));
        }
    }

    /// Drop every candidate worse than `tip`.
    pub fn prune_candidates(&mut self, tip: BlockId) {
        let tip_key = self.key(tip);
        self.candidates.retain(|k| *k <= tip_key);
    }

    /// Re-add every qualifying entry that is not worse than `tip`.
    pub fn refill_candidates(&mut self, tip: BlockId) {
        let qualifying: Vec<BlockId> = self
            .ids()
            .filter(|&id| {
                let e = self.get(id);
                e.is_valid(Validity::Transactions)
                    && e.chain_tx_count > 0
                    && !self.is_worse(id, tip)
                    && !self.has_failed_ancestor(id)
            })
            .collect();
        for id in qualifying {
            self.candidates.insert(self.key(id));
        }
    }

    fn has_failed_ancestor(&self, id: BlockId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if self.get(c).is_failed() {
                return true;
            }
            cur = self.get(c).parent;
        }
        false
    }

    /// The best candidate whose path from the active chain is fully
    /// stored, not failed, and consistent with the checkpoints.
    ///
    /// Candidates failing the walk are removed. Descendants of a failed
    /// entry are marked [`Failure::Child`]; descendants of a missing body
    /// return to the unlinked map.
    pub fn find_best_candidate(
        &mut self,
        chain: &ActiveChain,
        checkpoints: &CheckpointSet,
    ) -> Option<BlockId> {
        loop {
            let best = self.candidates.first()?.id;

            let mut test = best;
            let mut usable = true;
            while !chain.contains(self, test) {
                let e = self.get(test);
                if e.is_failed() || !e.has_data() {
                    let failed_chain = e.is_failed();
                    let mut walk = best;
                    while walk != test {
                        let key = self.key(walk);
                        self.candidates.remove(&key);
                        if failed_chain {
                            if self.get(walk).failure.is_none() {
                                self.get_mut(walk).failure = Some(Failure::Child);
                            }
                            self.note_invalid(walk);
                        } else if let Some(parent) = self.get(walk).parent {
                            let waiting = self.unlinked.entry(parent).or_default();
                            if !waiting.contains(&walk) {
                                waiting.push(walk);
                            }
                        }
                        match self.get(walk).parent {
                            Some(p) => walk = p,
                            None => break,
                        }
                    }
                    let key = self.key(test);
                    self.candidates.remove(&key);
                    usable = false;
                    break;
                }
                match e.parent {
                    Some(p) => test = p,
                    None => break,
                }
            }
            if !usable {
                continue;
            }

            if let Some(v) = self.checkpoint_violation(best, checkpoints) {
                warn!(
                    hash = %self.get(best).hash,
                    pin = v.height,
                    "candidate conflicts with checkpoint, skipping"
                );
                let key = self.key(best);
                self.candidates.remove(&key);
                continue;
            }

            return Some(best);
        }
    }

    // ------------------------------------------------------------------
    // Failure marks
    // ------------------------------------------------------------------

    fn note_invalid(&mut self, id: BlockId) {
        let work = self.get(id).chain_work;
        if self.best_invalid.is_none_or(|b| self.get(b).chain_work < work) {
            self.best_invalid = Some(id);
        }
    }

    /// Record that `id` broke a consensus rule. The entry and every
    /// candidate descending from it leave the candidate set.
    pub fn mark_failed(&mut self, id: BlockId) {
        let key = self.key(id);
        self.candidates.remove(&key);
        self.get_mut(id).failure = Some(Failure::Valid);
        self.note_invalid(id);

        let height = self.get(id).height;
        let doomed: Vec<CandidateKey> = self
            .candidates
            .iter()
            .filter(|k| self.get(k.id).height > height && self.ancestor(k.id, height) == Some(id))
            .copied()
            .collect();
        for key in doomed {
            self.candidates.remove(&key);
            self.get_mut(key.id).failure = Some(Failure::Child);
        }
        debug!(hash = %self.get(id).hash, "block marked invalid");
    }

    /// Mark `id` invalid and every known descendant as failed-child, then
    /// rebuild the candidate set around `tip`. The caller has already
    /// disconnected `id` from the active chain.
    pub fn invalidate(&mut self, id: BlockId, tip: BlockId) {
        self.mark_failed(id);
        let height = self.get(id).height;
        let descendants: Vec<BlockId> = self
            .ids()
            .filter(|&d| self.get(d).height > height && self.ancestor(d, height) == Some(id))
            .collect();
        for d in descendants {
            let key = self.key(d);
            self.candidates.remove(&key);
            if self.get(d).failure.is_none() {
                self.get_mut(d).failure = Some(Failure::Child);
            }
        }
        self.refill_candidates(tip);
    }

    /// Clear failure marks on `id`, its descendants and its ancestors, and
    /// restore candidates that now qualify.
    pub fn reset_failure_flags(&mut self, id: BlockId, tip: BlockId) {
        let height = self.get(id).height;
        let affected: Vec<BlockId> = self
            .ids()
            .filter(|&d| self.get(d).is_failed() && self.ancestor(d, height) == Some(id))
            .collect();
        for d in affected {
            self.get_mut(d).failure = None;
            if self.best_invalid == Some(d) {
                self.best_invalid = None;
            }
        }
        let mut cur = self.get(id).parent;
        while let Some(c) = cur {
            if self.get(c).is_failed() {
                self.get_mut(c).failure = None;
                if self.best_invalid == Some(c) {
                    self.best_invalid = None;
                }
            }
            cur = self.get(c).parent;
        }
        self.refill_candidates(tip);
    }

    /// Treat `id` as if it arrived before every block of equal work.
    ///
    /// A no-op returning `false` when `id` has less work than `tip`.
    /// Otherwise `id` takes the next negative sequence id (the counter
    /// resets whenever the tip has gained work since the last call), is
    /// re-inserted as a candidate, and candidates worse than `tip` are
    /// pruned.
    pub fn mark_precious(&mut self, id: BlockId, tip: BlockId) -> bool {
        let tip_work = self.get(tip).chain_work;
        if self.get(id).chain_work < tip_work {
            return false;
        }
        if tip_work > self.last_precious_work {
            self.precious_sequence = -1;
        }
        self.last_precious_work = tip_work;

        let key = self.key(id);
        let was_candidate = self.candidates.remove(&key);
        let sequence = self.precious_sequence;
        self.precious_sequence = self.precious_sequence.saturating_sub(1);
        self.get_mut(id).sequence = sequence;

        if was_candidate || self.get(id).chain_tx_count > 0 {
            self.add_candidate(id);
            self.prune_candidates(tip);
        }
        true
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Entries changed since the last call, in persisted form.
    pub fn take_dirty(&mut self) -> Vec<DiskBlockIndex> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|id| self.get(id).to_disk())
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Rebuild the index from persisted records. Candidates are left
    /// empty; the caller refills them once the tip is known.
    pub fn load(mut records: Vec<DiskBlockIndex>) -> Result<Self, CairnError> {
        records.sort_by_key(|r| r.height);
        let mut index = Self::new();
        for rec in records {
            let parent = if rec.height == 0 {
                None
            } else {
                Some(index.lookup(&rec.header.prev_hash).ok_or_else(|| {
                    ChainStateError::Inconsistent(format!(
                        "stored block {} has unknown parent {}",
                        rec.hash(),
                        rec.header.prev_hash
                    ))
                })?)
            };
            let id = index.push_entry(rec.header, parent);
            if index.get(id).height != rec.height {
                return Err(ChainStateError::Inconsistent(format!(
                    "stored block {} claims height {}",
                    index.get(id).hash,
                    rec.height
                ))
                .into());
            }
            let parent_tx = parent.map_or(0, |p| index.entries[p.index()].chain_tx_count);
            let e = &mut index.entries[id.index()];
            e.validity = rec.validity;
            e.failure = rec.failure;
            e.data_pos = rec.data_pos;
            e.undo_pos = rec.undo_pos;
            e.tx_count = rec.tx_count;
            e.chain_tx_count = if e.tx_count > 0 && (parent.is_none() || parent_tx > 0) {
                parent_tx + e.tx_count
            } else {
                0
            };
            if e.chain_tx_count > 0 {
                e.sequence = SEQUENCE_FROM_DISK;
            }
            let waiting = e.has_data() && e.chain_tx_count == 0;
            if e.is_failed() {
                index.note_invalid(id);
            }
            if waiting {
                if let Some(p) = parent {
                    index.unlinked.entry(p).or_default().push(id);
                }
            }
        }
        index.best_header = index
            .ids()
            .filter(|&id| !index.get(id).is_failed())
            .max_by_key(|&id| index.get(id).chain_work);
        index.dirty.clear();
        Ok(index)
    }

    /// Rank the tip restored at startup ahead of loaded blocks of equal
    /// work, so a restart never switches between equal-work branches.
    pub fn prefer_loaded_tip(&mut self, tip: BlockId) {
        let key = self.key(tip);
        let was_candidate = self.candidates.remove(&key);
        self.entries[tip.index()].sequence = SEQUENCE_TIP_FROM_DISK;
        if was_candidate {
            self.candidates.insert(self.key(tip));
        }
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Walk the whole tree and verify its invariants against `chain`.
    pub fn consistency_check(&self, chain: &ActiveChain) -> Result<(), CairnError> {
        let fail = |msg: String| -> Result<(), CairnError> {
            Err(ChainStateError::Inconsistent(msg).into())
        };
        if self.entries.is_empty() {
            return Ok(());
        }

        let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); self.entries.len()];
        let mut roots = Vec::new();
        for id in self.ids() {
            match self.get(id).parent {
                Some(p) => children[p.index()].push(id),
                None => roots.push(id),
            }
        }
        if roots.len() != 1 {
            return fail(format!("{} root entries", roots.len()));
        }

        let tip = chain.tip();
        if !self.is_candidate(tip) {
            return fail(format!("tip {} missing from candidates", self.get(tip).hash));
        }

        // (id, first failed ancestor-or-self, first entry without a body)
        let mut stack: Vec<(BlockId, Option<BlockId>, Option<BlockId>)> = Vec::new();
        let root = roots[0];
        let root_e = self.get(root);
        stack.push((
            root,
            root_e.is_failed().then_some(root),
            (!root_e.has_data()).then_some(root),
        ));
        let mut visited = 0usize;

        while let Some((id, first_invalid, first_missing)) = stack.pop() {
            visited += 1;
            let e = self.get(id);

            if self.by_hash.get(&e.hash) != Some(&id) {
                return fail(format!("hash map does not point at {}", e.hash));
            }
            if let Some(p) = e.parent {
                let pe = self.get(p);
                if e.height != pe.height + 1 {
                    return fail(format!("{} height does not follow parent", e.hash));
                }
                if e.chain_work != pe.chain_work + block_work(e.header.difficulty_target) {
                    return fail(format!("{} chain work mismatch", e.hash));
                }
                for level in [Validity::Tree, Validity::Chain, Validity::Scripts] {
                    if e.validity >= level && pe.validity < level {
                        return fail(format!("{} validated past its parent", e.hash));
                    }
                }
                if e.skip != self.ancestor(p, skip_height(e.height)) {
                    return fail(format!("{} bad skip pointer", e.hash));
                }
            }
            if e.failure == Some(Failure::Child)
                && e.parent.is_none_or(|p| !self.has_failed_ancestor(p))
            {
                return fail(format!("{} failed-child without failed ancestor", e.hash));
            }
            if (first_missing.is_none()) != (e.chain_tx_count > 0) {
                return fail(format!("{} cumulative tx count disagrees with bodies", e.hash));
            }

            let in_set = self.is_candidate(id);
            if in_set {
                if first_invalid.is_some() || !e.is_valid(Validity::Transactions) || e.chain_tx_count == 0 {
                    return fail(format!("{} is a candidate but not usable", e.hash));
                }
                if self.is_worse(id, tip) {
                    return fail(format!("{} is a candidate worse than the tip", e.hash));
                }
            } else if first_invalid.is_none()
                && first_missing.is_none()
                && e.is_valid(Validity::Transactions)
                && !self.is_worse(id, tip)
            {
                return fail(format!("{} qualifies but is not a candidate", e.hash));
            }

            let waiting = e
                .parent
                .and_then(|p| self.unlinked.get(&p))
                .is_some_and(|v| v.contains(&id));
            if waiting && (!e.has_data() || e.chain_tx_count != 0) {
                return fail(format!("{} waits in the unlinked map without reason", e.hash));
            }

            for &child in &children[id.index()] {
                let ce = self.get(child);
                stack.push((
                    child,
                    first_invalid.or(ce.is_failed().then_some(child)),
                    first_missing.or((!ce.has_data()).then_some(child)),
                ));
            }
        }

        if visited != self.entries.len() {
            return fail(format!("{} of {} entries reachable", visited, self.entries.len()));
        }
        Ok(())
    }
}
