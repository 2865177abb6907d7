//! The active chain: one entry per height from genesis to the tip.

use cairn_core::types::Hash256;

use crate::block_index::{BlockId, BlockIndex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChain {
    blocks: Vec<BlockId>,
}

impl ActiveChain {
    pub fn new(genesis: BlockId) -> Self {
        Self {
            blocks: vec![genesis],
        }
    }

    pub fn genesis(&self) -> BlockId {
        self.blocks[0]
    }

    pub fn tip(&self) -> BlockId {
        self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        (self.blocks.len() - 1) as u64
    }

    pub fn at(&self, height: u64) -> Option<BlockId> {
        self.blocks.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: BlockId) -> bool {
        self.at(index.get(id).height) == Some(id)
    }

    /// The successor of `id` on the chain, if `id` is on it and not the tip.
    pub fn next(&self, index: &BlockIndex, id: BlockId) -> Option<BlockId> {
        if self.contains(index, id) {
            self.at(index.get(id).height + 1)
        } else {
            None
        }
    }

    /// Make `id` the tip, rewriting only the heights that differ.
    pub fn set_tip(&mut self, index: &BlockIndex, id: BlockId) {
        let height = index.get(id).height as usize;
        self.blocks.resize(height + 1, id);
        let mut cur = Some(id);
        while let Some(c) = cur {
            let h = index.get(c).height as usize;
            if self.blocks[h] == c && h != height {
                break;
            }
            self.blocks[h] = c;
            cur = index.get(c).parent;
        }
    }

    /// The highest block on the chain that is an ancestor of `id` (or `id`).
    pub fn find_fork(&self, index: &BlockIndex, id: BlockId) -> BlockId {
        let mut cur = id;
        if index.get(cur).height > self.height() {
            if let Some(a) = index.ancestor(cur, self.height()) {
                cur = a;
            }
        }
        while !self.contains(index, cur) {
            match index.get(cur).parent {
                Some(p) => cur = p,
                None => return self.genesis(),
            }
        }
        cur
    }

    /// Block hashes from `from` back to genesis, dense for the first ten
    /// entries and exponentially sparser after that.
    pub fn locator(&self, index: &BlockIndex, from: BlockId) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1u64;
        let mut cur = from;
        loop {
            let e = index.get(cur);
            hashes.push(e.hash);
            if e.height == 0 {
                break;
            }
            let height = e.height.saturating_sub(step);
            cur = if self.contains(index, cur) {
                match self.at(height) {
                    Some(a) => a,
                    None => break,
                }
            } else {
                match index.ancestor(cur, height) {
                    Some(a) => a,
                    None => break,
                }
            };
            if hashes.len() > 10 {
                step *= 2;
            }
        }
        hashes
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = BlockId> + '_ {
        self.blocks.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::types::BlockHeader;

    fn build(index: &mut BlockIndex, parent: BlockId, n: usize, salt: u64) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cur = parent;
        for i in 0..n {
            let header = BlockHeader {
                version: 4,
                prev_hash: index.get(cur).hash,
                merkle_root: Hash256::ZERO,
                timestamp: 1_000 + i as u64,
                difficulty_target: u64::MAX,
                nonce: salt * 10_000 + i as u64,
            };
            cur = index.register_header(&header, |_, _| Ok(())).unwrap();
            out.push(cur);
        }
        out
    }

    fn setup() -> (BlockIndex, BlockId) {
        let mut index = BlockIndex::new();
        let genesis = index.insert_genesis(BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 0,
            difficulty_target: u64::MAX,
            nonce: 0,
        });
        (index, genesis)
    }

    #[test]
    fn new_chain_is_just_genesis() {
        let (_, g) = setup();
        let chain = ActiveChain::new(g);
        assert_eq!(chain.tip(), g);
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn set_tip_switches_branches() {
        let (mut index, g) = setup();
        let main = build(&mut index, g, 5, 1);
        let side = build(&mut index, main[1], 6, 2);
        let mut chain = ActiveChain::new(g);

        chain.set_tip(&index, main[4]);
        assert_eq!(chain.height(), 5);
        assert!(chain.contains(&index, main[2]));

        chain.set_tip(&index, side[5]);
        assert_eq!(chain.height(), 8);
        assert!(chain.contains(&index, main[1]));
        assert!(!chain.contains(&index, main[2]));
        assert_eq!(chain.at(3), Some(side[0]));

        chain.set_tip(&index, main[0]);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip(), main[0]);
    }

    #[test]
    fn find_fork_and_next() {
        let (mut index, g) = setup();
        let main = build(&mut index, g, 5, 1);
        let side = build(&mut index, main[1], 2, 2);
        let mut chain = ActiveChain::new(g);
        chain.set_tip(&index, main[4]);

        assert_eq!(chain.find_fork(&index, side[1]), main[1]);
        assert_eq!(chain.find_fork(&index, main[3]), main[3]);
        assert_eq!(chain.next(&index, main[1]), Some(main[2]));
        assert_eq!(chain.next(&index, main[4]), None);
        assert_eq!(chain.next(&index, side[0]), None);
    }

    #[test]
    fn locator_is_dense_then_sparse() {
        let (mut index, g) = setup();
        let main = build(&mut index, g, 100, 1);
        let mut chain = ActiveChain::new(g);
        chain.set_tip(&index, main[99]);

        let loc = chain.locator(&index, chain.tip());
        assert_eq!(loc[0], index.get(main[99]).hash);
        assert_eq!(loc[1], index.get(main[98]).hash);
        assert_eq!(*loc.last().unwrap(), index.get(g).hash);
        assert!(loc.len() < 25);
    }
}
