//! Orphan pool: blocks whose parents have not arrived yet.
//!
//! Bounded and expiring. On overflow the newest-timestamped orphan is
//! evicted first, preferring older orphans whose parents are more
//! likely to still arrive.

use std::collections::{HashMap, HashSet, VecDeque};

use dagd_consensus::Hash256;
use dagd_primitives::block::Block;

pub const MAX_ORPHAN_BLOCKS: usize = 100;
pub const ORPHAN_EXPIRE_MS: i64 = 60 * 60 * 1000;

struct OrphanBlock {
    block: Block,
    expiration: i64,
}

#[derive(Default)]
pub struct OrphanPool {
    orphans: HashMap<Hash256, OrphanBlock>,
    prev_orphans: HashMap<Hash256, Vec<Hash256>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_known(&self, hash: &Hash256) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    /// Adds an orphan, lazily evicting expired entries and enforcing the
    /// pool bound.
    pub fn add(&mut self, block: Block, now: i64) {
        let expired: Vec<Hash256> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| now > orphan.expiration)
            .map(|(&hash, _)| hash)
            .collect();
        for hash in expired {
            self.remove(&hash);
        }

        if self.orphans.len() + 1 > MAX_ORPHAN_BLOCKS {
            let newest = self
                .orphans
                .iter()
                .max_by_key(|(_, orphan)| orphan.block.header.timestamp)
                .map(|(&hash, orphan)| (hash, orphan.block.header.timestamp));
            if let Some((newest_hash, newest_timestamp)) = newest {
                if block.header.timestamp > newest_timestamp {
                    // The incoming orphan is the newest of them all;
                    // drop it instead.
                    return;
                }
                self.remove(&newest_hash);
            }
        }

        let hash = block.hash();
        for parent_hash in &block.header.parent_hashes {
            self.prev_orphans
                .entry(*parent_hash)
                .or_default()
                .push(hash);
        }
        self.orphans.insert(
            hash,
            OrphanBlock {
                block,
                expiration: now + ORPHAN_EXPIRE_MS,
            },
        );
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<Block> {
        let orphan = self.orphans.remove(hash)?;
        for parent_hash in &orphan.block.header.parent_hashes {
            if let Some(children) = self.prev_orphans.get_mut(parent_hash) {
                children.retain(|child| child != hash);
                if children.is_empty() {
                    self.prev_orphans.remove(parent_hash);
                }
            }
        }
        Some(orphan.block)
    }

    /// Removes and returns the orphans that list `parent_hash` as a
    /// parent.
    pub fn take_children(&mut self, parent_hash: &Hash256) -> Vec<Block> {
        let children = self
            .prev_orphans
            .get(parent_hash)
            .cloned()
            .unwrap_or_default();
        children
            .iter()
            .filter_map(|child| self.remove(child))
            .collect()
    }

    /// All parents missing from the orphan sub-DAG rooted at
    /// `orphan_hash`, judged against `is_in_dag`.
    pub fn missing_ancestors(
        &self,
        orphan_hash: &Hash256,
        is_in_dag: impl Fn(&Hash256) -> bool,
    ) -> Vec<Hash256> {
        let mut missing = Vec::new();
        let mut visited: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = VecDeque::from([*orphan_hash]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current) {
                continue;
            }
            match self.orphans.get(&current) {
                Some(orphan) => {
                    for parent in &orphan.block.header.parent_hashes {
                        queue.push_back(*parent);
                    }
                }
                None => {
                    if !is_in_dag(&current) && current != *orphan_hash {
                        missing.push(current);
                    }
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagd_consensus::ZERO_HASH;
    use dagd_primitives::block::BlockHeader;

    fn orphan_block(nonce: u64, timestamp: i64, parents: Vec<Hash256>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                parent_hashes: parents,
                hash_merkle_root: ZERO_HASH,
                accepted_id_merkle_root: ZERO_HASH,
                utxo_commitment: ZERO_HASH,
                timestamp,
                bits: 0,
                nonce,
            },
            transactions: Vec::new(),
        }
    }

    #[test]
    fn add_index_and_take_children() {
        let mut pool = OrphanPool::new();
        let parent_hash = [5u8; 32];
        let child = orphan_block(1, 100, vec![parent_hash]);
        let child_hash = child.hash();
        pool.add(child, 0);

        assert!(pool.is_known(&child_hash));
        let children = pool.take_children(&parent_hash);
        assert_eq!(children.len(), 1);
        assert!(!pool.is_known(&child_hash));
        assert!(pool.is_empty());
    }

    #[test]
    fn full_pool_drops_newest_incoming() {
        let mut pool = OrphanPool::new();
        for i in 0..MAX_ORPHAN_BLOCKS as u64 {
            pool.add(orphan_block(i, 1_000 + i as i64, vec![[1u8; 32]]), 0);
        }
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);

        // Younger than everything in the pool: rejected outright.
        let young = orphan_block(999, 10_000, vec![[1u8; 32]]);
        let young_hash = young.hash();
        pool.add(young, 0);
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(!pool.is_known(&young_hash));
    }

    #[test]
    fn full_pool_evicts_newest_for_older_incoming() {
        let mut pool = OrphanPool::new();
        let mut newest_hash = ZERO_HASH;
        for i in 0..MAX_ORPHAN_BLOCKS as u64 {
            let block = orphan_block(i, 1_000 + i as i64, vec![[1u8; 32]]);
            if i == MAX_ORPHAN_BLOCKS as u64 - 1 {
                newest_hash = block.hash();
            }
            pool.add(block, 0);
        }

        let old = orphan_block(998, 10, vec![[1u8; 32]]);
        let old_hash = old.hash();
        pool.add(old, 0);
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(pool.is_known(&old_hash));
        assert!(!pool.is_known(&newest_hash));
    }

    #[test]
    fn expired_orphans_are_evicted_lazily() {
        let mut pool = OrphanPool::new();
        let stale = orphan_block(1, 50, vec![[1u8; 32]]);
        let stale_hash = stale.hash();
        pool.add(stale, 0);

        pool.add(orphan_block(2, 60, vec![[2u8; 32]]), ORPHAN_EXPIRE_MS + 1);
        assert!(!pool.is_known(&stale_hash));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn missing_ancestors_walks_the_orphan_subdag() {
        let mut pool = OrphanPool::new();
        let missing_parent = [9u8; 32];
        let middle = orphan_block(1, 100, vec![missing_parent]);
        let middle_hash = middle.hash();
        let leaf = orphan_block(2, 101, vec![middle_hash]);
        let leaf_hash = leaf.hash();
        pool.add(middle, 0);
        pool.add(leaf, 0);

        let missing = pool.missing_ancestors(&leaf_hash, |_| false);
        assert_eq!(missing, vec![missing_parent]);
    }
}
