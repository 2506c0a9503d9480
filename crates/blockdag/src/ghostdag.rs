//! The GHOSTDAG k-cluster coloring protocol.
//!
//! Given a new block's parents, computes its selected parent, blue set,
//! blue anticone sizes and blue score. A candidate from the selected
//! parent's anticone is admitted into the blue set only if doing so
//! keeps every blue block's blue anticone within `k`.
//!
//! For further details see https://eprint.iacr.org/2018/104.pdf

use std::collections::{HashMap, HashSet, VecDeque};

use dagd_consensus::KType;

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::error::DagError;
use crate::reachability::ReachabilityTree;

/// The coloring result for one block (or for the virtual).
#[derive(Clone, Debug, Default)]
pub struct GhostdagData {
    pub selected_parent: Option<NodeHandle>,
    /// Blue blocks in the selected parent's anticone, selected parent
    /// first.
    pub blues: Vec<NodeHandle>,
    pub blues_anticone_sizes: HashMap<NodeHandle, KType>,
    pub blue_score: u64,
}

/// Runs GHOSTDAG over `parents`. Besides the coloring, returns the
/// selected parent's anticone (restricted to the new block's past),
/// which the reachability tree needs for its future-covering updates.
pub fn run(
    nodes: &BlockNodeStore,
    reachability: &ReachabilityTree,
    parents: &[NodeHandle],
    k: KType,
) -> Result<(GhostdagData, Vec<NodeHandle>), DagError> {
    let Some(selected_parent) = nodes.bluest(parents) else {
        // Genesis: empty past, nothing to color.
        return Ok((GhostdagData::default(), Vec::new()));
    };

    let mut data = GhostdagData {
        selected_parent: Some(selected_parent),
        blues: vec![selected_parent],
        blues_anticone_sizes: HashMap::from([(selected_parent, 0)]),
        blue_score: 0,
    };

    let mut anticone = selected_parent_anticone(nodes, reachability, parents, selected_parent)?;
    anticone.sort_unstable_by(|&a, &b| {
        let (left, right) = (nodes.node(a), nodes.node(b));
        if left.is_less_than(right) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    });

    for &candidate in &anticone {
        let mut candidate_blues_anticone_sizes: HashMap<NodeHandle, KType> = HashMap::new();
        let mut candidate_anticone_size: KType = 0;
        let mut possibly_blue = true;

        // Walk the new block's selected-parent chain (starting with the
        // new block itself, whose blues are `data.blues`), inspecting
        // every blue block not in the candidate's past.
        let mut chain_block: Option<NodeHandle> = None; // None marks the new block
        'chain: loop {
            if let Some(chain_handle) = chain_block {
                // Once the candidate is in the chain block's future, all
                // remaining blues are in the candidate's past and cannot
                // violate the k-cluster condition.
                if reachability.is_in_past(chain_handle, candidate)? {
                    break;
                }
            }

            let blues: &[NodeHandle] = match chain_block {
                None => &data.blues,
                Some(handle) => &nodes.node(handle).blues,
            };
            for &blue in blues {
                if reachability.is_in_past(blue, candidate)? {
                    continue;
                }

                let blue_size = blue_anticone_size(nodes, &data, blue)?;
                candidate_blues_anticone_sizes.insert(blue, blue_size);
                candidate_anticone_size += 1;

                if candidate_anticone_size > k {
                    // The candidate's blue anticone exceeded k.
                    possibly_blue = false;
                    break 'chain;
                }
                if blue_size == k {
                    // A blue block's own anticone is already saturated;
                    // admitting the candidate would push it past k.
                    possibly_blue = false;
                    break 'chain;
                }
                if blue_size > k {
                    return Err(DagError::corruption(
                        "found blue anticone size larger than k",
                    ));
                }
            }

            chain_block = match chain_block {
                None => data.selected_parent,
                Some(handle) => nodes.node(handle).selected_parent,
            };
            if chain_block.is_none() {
                break;
            }
        }

        if possibly_blue {
            data.blues.push(candidate);
            data.blues_anticone_sizes
                .insert(candidate, candidate_anticone_size);
            for (blue, size) in candidate_blues_anticone_sizes {
                data.blues_anticone_sizes.insert(blue, size + 1);
            }

            // blues holds at most k+1 blocks: the selected parent and k
            // anticone members.
            if data.blues.len() as u64 == k as u64 + 1 {
                break;
            }
        }
    }

    data.blue_score = nodes.node(selected_parent).blue_score + data.blues.len() as u64;
    Ok((data, anticone))
}

/// The blue anticone size of `blue` from the viewpoint of the block
/// being colored. Found by walking the new block's selected-parent
/// chain until a stored entry for `blue` appears.
fn blue_anticone_size(
    nodes: &BlockNodeStore,
    data: &GhostdagData,
    blue: NodeHandle,
) -> Result<KType, DagError> {
    if let Some(&size) = data.blues_anticone_sizes.get(&blue) {
        return Ok(size);
    }
    let mut current = data.selected_parent;
    while let Some(handle) = current {
        if let Some(&size) = nodes.node(handle).blues_anticone_sizes.get(&blue) {
            return Ok(size);
        }
        current = nodes.node(handle).selected_parent;
    }
    Err(DagError::corruption(
        "blue block is not in the blue set of any selected-chain ancestor",
    ))
}

/// The blocks in the selected parent's anticone that are in the new
/// block's past: a breadth-first walk from the other parents, pruning
/// anything in the selected parent's past.
fn selected_parent_anticone(
    nodes: &BlockNodeStore,
    reachability: &ReachabilityTree,
    parents: &[NodeHandle],
    selected_parent: NodeHandle,
) -> Result<Vec<NodeHandle>, DagError> {
    let mut anticone_set: HashSet<NodeHandle> = HashSet::new();
    let mut anticone: Vec<NodeHandle> = Vec::new();
    let mut selected_parent_past: HashSet<NodeHandle> = HashSet::new();
    let mut queue: VecDeque<NodeHandle> = VecDeque::new();

    for &parent in parents {
        if parent == selected_parent {
            continue;
        }
        if anticone_set.insert(parent) {
            anticone.push(parent);
            queue.push_back(parent);
        }
    }

    while let Some(current) = queue.pop_front() {
        for &parent in &nodes.node(current).parents {
            if anticone_set.contains(&parent) || selected_parent_past.contains(&parent) {
                continue;
            }
            if reachability.is_in_past(parent, selected_parent)? {
                selected_parent_past.insert(parent);
                continue;
            }
            anticone_set.insert(parent);
            anticone.push(parent);
            queue.push_back(parent);
        }
    }

    Ok(anticone)
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
        k: KType,
        next_nonce: u64,
    }

    impl Fixture {
        fn new(k: KType) -> Self {
            Self {
                nodes: BlockNodeStore::new(),
                reachability: ReachabilityTree::new(),
                k,
                next_nonce: 0,
            }
        }

        /// Colors and inserts a block with the given parents, mirroring
        /// the orchestrator's accept path.
        fn add_block(&mut self, parents: Vec<NodeHandle>) -> NodeHandle {
            self.next_nonce += 1;
            let (data, anticone) =
                run(&self.nodes, &self.reachability, &parents, self.k).expect("ghostdag");
            let header = BlockHeader {
                version: 1,
                parent_hashes: parents
                    .iter()
                    .map(|&p| self.nodes.node(p).hash)
                    .collect(),
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
                .expect("reachability add");
            handle
        }
    }

    #[test]
    fn linear_chain_with_k_zero() {
        let mut fx = Fixture::new(0);
        let genesis = fx.add_block(Vec::new());
        let a = fx.add_block(vec![genesis]);
        let b = fx.add_block(vec![a]);
        let c = fx.add_block(vec![b]);

        for (i, handle) in [genesis, a, b, c].into_iter().enumerate() {
            let node = fx.nodes.node(handle);
            assert_eq!(node.blue_score, i as u64);
            if i > 0 {
                assert_eq!(node.blues.len(), 1);
                assert_eq!(Some(node.blues[0]), node.selected_parent);
            }
        }
    }

    #[test]
    fn fork_under_k_one_admits_both_sides() {
        let mut fx = Fixture::new(1);
        let genesis = fx.add_block(Vec::new());
        let left = fx.add_block(vec![genesis]);
        let right = fx.add_block(vec![genesis]);
        let merge = fx.add_block(vec![left, right]);

        let node = fx.nodes.node(merge);
        // Selected parent plus the other fork side: both blue under k=1.
        assert_eq!(node.blues.len(), 2);
        assert_eq!(node.blue_score, 3);
        let selected = node.selected_parent.expect("selected parent");
        let other = if selected == left { right } else { left };
        assert_eq!(node.blues[0], selected);
        assert!(node.blues.contains(&other));
        assert_eq!(node.blues_anticone_sizes[&other], 1);
    }

    #[test]
    fn fork_under_k_zero_rejects_the_other_side() {
        let mut fx = Fixture::new(0);
        let genesis = fx.add_block(Vec::new());
        let left = fx.add_block(vec![genesis]);
        let right = fx.add_block(vec![genesis]);
        let merge = fx.add_block(vec![left, right]);

        let node = fx.nodes.node(merge);
        assert_eq!(node.blues.len(), 1);
        assert_eq!(node.blue_score, 2);
        // The non-selected side stays red and contributes no blue score.
        assert_eq!(node.blues_anticone_sizes.len(), 1);
    }

    #[test]
    fn blues_are_bounded_by_k_plus_one() {
        let k: KType = 2;
        let mut fx = Fixture::new(k);
        let genesis = fx.add_block(Vec::new());
        let mut siblings = Vec::new();
        for _ in 0..6 {
            siblings.push(fx.add_block(vec![genesis]));
        }
        let merge = fx.add_block(siblings.clone());
        let node = fx.nodes.node(merge);
        assert!(node.blues.len() as u64 <= k as u64 + 1);
        assert_eq!(node.blues[0], node.selected_parent.expect("selected"));
        assert_eq!(
            node.blue_score,
            fx.nodes
                .node(node.selected_parent.expect("selected"))
                .blue_score
                + node.blues.len() as u64
        );
    }

    #[test]
    fn selected_parent_is_bluest_parent() {
        let mut fx = Fixture::new(3);
        let genesis = fx.add_block(Vec::new());
        let a = fx.add_block(vec![genesis]);
        let b = fx.add_block(vec![a]);
        let side = fx.add_block(vec![genesis]);
        let merge = fx.add_block(vec![b, side]);

        let node = fx.nodes.node(merge);
        // b has blue score 2, side has 1.
        assert_eq!(node.selected_parent, Some(b));
        assert_eq!(node.blue_score, 4);
    }

    #[test]
    fn anticone_walk_collects_side_branch() {
        let mut fx = Fixture::new(5);
        let genesis = fx.add_block(Vec::new());
        let a = fx.add_block(vec![genesis]);
        let b = fx.add_block(vec![a]);
        // Side chain of two blocks off genesis.
        let s1 = fx.add_block(vec![genesis]);
        let s2 = fx.add_block(vec![s1]);
        let merge_parents = vec![b, s2];
        let (data, anticone) =
            run(&fx.nodes, &fx.reachability, &merge_parents, fx.k).expect("ghostdag");
        assert_eq!(data.selected_parent, Some(b));
        let mut sorted = anticone.clone();
        sorted.sort_unstable();
        let mut expected = vec![s1, s2];
        expected.sort_unstable();
        assert_eq!(sorted, expected);
        // All side blocks admitted under a roomy k.
        assert_eq!(data.blues.len(), 3);
        assert_eq!(data.blue_score, 3 + 2);
    }
}
