//! The virtual block: a synthetic node whose parents are the DAG tips.
//!
//! Alongside the tips it caches the virtual's GHOSTDAG coloring and the
//! selected-parent chain, both as a membership set and as an ordered
//! slice, so retips yield the chain delta cheaply.

use std::collections::HashSet;

use dagd_consensus::{Hash256, KType};

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::error::DagError;
use crate::ghostdag::{self, GhostdagData};
use crate::reachability::ReachabilityTree;

/// The selected-parent-chain delta produced by a retip. Hashes are
/// ordered from the fork point outward.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainUpdates {
    pub removed_chain_block_hashes: Vec<Hash256>,
    pub added_chain_block_hashes: Vec<Hash256>,
}

#[derive(Default)]
pub struct VirtualBlock {
    tips: Vec<NodeHandle>,
    data: GhostdagData,
    chain_set: HashSet<NodeHandle>,
    chain_slice: Vec<NodeHandle>,
}

impl VirtualBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tips(&self) -> &[NodeHandle] {
        &self.tips
    }

    pub fn data(&self) -> &GhostdagData {
        &self.data
    }

    pub fn selected_parent(&self) -> Option<NodeHandle> {
        self.data.selected_parent
    }

    pub fn blue_score(&self) -> u64 {
        self.data.blue_score
    }

    pub fn selected_parent_chain_contains(&self, node: NodeHandle) -> bool {
        self.chain_set.contains(&node)
    }

    /// The selected-parent chain from genesis to the virtual's selected
    /// parent, oldest first.
    pub fn selected_parent_chain(&self) -> &[NodeHandle] {
        &self.chain_slice
    }

    /// Adds a new tip, dropping any current tips it supersedes (its
    /// parents), and returns the chain delta.
    pub fn add_tip(
        &mut self,
        nodes: &BlockNodeStore,
        reachability: &ReachabilityTree,
        k: KType,
        new_tip: NodeHandle,
    ) -> Result<ChainUpdates, DagError> {
        let parents = &nodes.node(new_tip).parents;
        let mut updated: Vec<NodeHandle> = self
            .tips
            .iter()
            .copied()
            .filter(|tip| !parents.contains(tip))
            .collect();
        updated.push(new_tip);
        self.set_tips(nodes, reachability, k, updated)
    }

    /// Replaces the tips outright and recomputes the virtual coloring.
    pub fn set_tips(
        &mut self,
        nodes: &BlockNodeStore,
        reachability: &ReachabilityTree,
        k: KType,
        tips: Vec<NodeHandle>,
    ) -> Result<ChainUpdates, DagError> {
        let old_selected_parent = self.data.selected_parent;
        let (data, _) = ghostdag::run(nodes, reachability, &tips, k)?;
        self.data = data;
        self.tips = tips;
        self.update_selected_parent_set(nodes, old_selected_parent)
    }

    /// Walks from the new selected parent down to the first block that
    /// is already on the cached chain; everything above the intersection
    /// on the old chain is removed, the walked blocks are appended.
    fn update_selected_parent_set(
        &mut self,
        nodes: &BlockNodeStore,
        old_selected_parent: Option<NodeHandle>,
    ) -> Result<ChainUpdates, DagError> {
        let mut nodes_to_add: Vec<NodeHandle> = Vec::new();
        let mut intersection: Option<NodeHandle> = None;
        let mut current = self.data.selected_parent;
        while let Some(node) = current {
            if self.chain_set.contains(&node) {
                intersection = Some(node);
                break;
            }
            nodes_to_add.push(node);
            current = nodes.node(node).selected_parent;
        }

        if intersection.is_none() && old_selected_parent.is_some() {
            return Err(DagError::corruption(
                "selected parent chains do not intersect",
            ));
        }

        let mut removed_chain_block_hashes = Vec::new();
        if let Some(intersection) = intersection {
            let mut node = old_selected_parent;
            while let Some(handle) = node {
                if handle == intersection {
                    break;
                }
                self.chain_set.remove(&handle);
                removed_chain_block_hashes.push(nodes.node(handle).hash);
                node = nodes.node(handle).selected_parent;
            }
            self.chain_slice
                .truncate(self.chain_slice.len() - removed_chain_block_hashes.len());
        }

        nodes_to_add.reverse();
        let mut added_chain_block_hashes = Vec::with_capacity(nodes_to_add.len());
        for &node in &nodes_to_add {
            self.chain_set.insert(node);
            added_chain_block_hashes.push(nodes.node(node).hash);
        }
        self.chain_slice.extend_from_slice(&nodes_to_add);

        Ok(ChainUpdates {
            removed_chain_block_hashes,
            added_chain_block_hashes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocknode::{BlockNode, STATUS_VALID};
    use dagd_consensus::ZERO_HASH;
    use dagd_primitives::block::BlockHeader;

    struct Fixture {
        nodes: BlockNodeStore,
        reachability: ReachabilityTree,
        virtual_block: VirtualBlock,
        k: KType,
        next_nonce: u64,
    }

    impl Fixture {
        fn new(k: KType) -> Self {
            Self {
                nodes: BlockNodeStore::new(),
                reachability: ReachabilityTree::new(),
                virtual_block: VirtualBlock::new(),
                k,
                next_nonce: 0,
            }
        }

        fn add_block(&mut self, parents: Vec<NodeHandle>) -> (NodeHandle, ChainUpdates) {
            self.next_nonce += 1;
            let (data, anticone) =
                ghostdag::run(&self.nodes, &self.reachability, &parents, self.k)
                    .expect("ghostdag");
            let header = BlockHeader {
                version: 1,
                parent_hashes: parents.iter().map(|&p| self.nodes.node(p).hash).collect(),
                hash_merkle_root: ZERO_HASH,
                accepted_id_merkle_root: ZERO_HASH,
                utxo_commitment: ZERO_HASH,
                timestamp: self.next_nonce as i64,
                bits: 0,
                nonce: self.next_nonce,
            };
            let handle = self.nodes.insert(BlockNode::new(
                header.hash(),
                header,
                parents,
                data.selected_parent,
                data.blues.clone(),
                data.blues_anticone_sizes.clone(),
                data.blue_score,
                STATUS_VALID,
            ));
            self.nodes.update_parents_children(handle);
            self.reachability
                .add_block(handle, data.selected_parent, &anticone)
                .expect("reachability");
            let updates = self
                .virtual_block
                .add_tip(&self.nodes, &self.reachability, self.k, handle)
                .expect("add tip");
            (handle, updates)
        }
    }

    #[test]
    fn linear_chain_grows_the_selected_chain() {
        let mut fx = Fixture::new(0);
        let (genesis, updates) = fx.add_block(Vec::new());
        assert_eq!(updates.added_chain_block_hashes.len(), 1);
        assert!(updates.removed_chain_block_hashes.is_empty());

        let (a, _) = fx.add_block(vec![genesis]);
        let (b, _) = fx.add_block(vec![a]);

        assert_eq!(fx.virtual_block.tips(), &[b]);
        assert_eq!(fx.virtual_block.selected_parent(), Some(b));
        assert_eq!(fx.virtual_block.selected_parent_chain(), &[genesis, a, b]);
        assert!(fx.virtual_block.selected_parent_chain_contains(a));
    }

    #[test]
    fn fork_keeps_both_tips() {
        let mut fx = Fixture::new(1);
        let (genesis, _) = fx.add_block(Vec::new());
        let (left, _) = fx.add_block(vec![genesis]);
        let (right, _) = fx.add_block(vec![genesis]);

        let mut tips = fx.virtual_block.tips().to_vec();
        tips.sort_unstable();
        let mut expected = vec![left, right];
        expected.sort_unstable();
        assert_eq!(tips, expected);
    }

    #[test]
    fn reorg_reports_removed_and_added_chain() {
        let mut fx = Fixture::new(0);
        let (genesis, _) = fx.add_block(Vec::new());
        let (a, _) = fx.add_block(vec![genesis]);
        let (b, _) = fx.add_block(vec![a]);

        // A competing chain from genesis that overtakes b's chain. The
        // reorg may split across the equal-score tie and the decisive
        // block, so the deltas are asserted in aggregate.
        let (c1, updates1) = fx.add_block(vec![genesis]);
        let (c2, updates2) = fx.add_block(vec![c1]);
        let (c3, updates3) = fx.add_block(vec![c2]);

        let mut removed = updates1.removed_chain_block_hashes;
        removed.extend(updates2.removed_chain_block_hashes);
        removed.extend(updates3.removed_chain_block_hashes);
        let mut added = updates1.added_chain_block_hashes;
        added.extend(updates2.added_chain_block_hashes);
        added.extend(updates3.added_chain_block_hashes);

        assert_eq!(
            removed,
            vec![fx.nodes.node(b).hash, fx.nodes.node(a).hash]
        );
        assert_eq!(
            added,
            vec![
                fx.nodes.node(c1).hash,
                fx.nodes.node(c2).hash,
                fx.nodes.node(c3).hash
            ]
        );
        assert_eq!(
            fx.virtual_block.selected_parent_chain(),
            &[genesis, c1, c2, c3]
        );
    }
}
