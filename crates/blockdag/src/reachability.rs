//! Reachability index over the selected-parent tree.
//!
//! Every node carries a half-open `u64` interval nested inside its
//! selected parent's interval, so selected-parent-tree ancestry is a
//! containment check. Non-selected-parent edges are collapsed into each
//! node's future covering set: an interval-ordered list of tree nodes
//! whose subtrees cover the node's DAG future outside its own subtree.
//! `is_in_past` is a containment check plus one binary search.

use std::collections::{HashMap, HashSet};

use dagd_consensus::ZERO_HASH;
use dagd_primitives::encoding::{DecodeError, Decoder, Encoder};
use dagd_storage::{Column, WriteBatch};

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::error::DagError;

/// Fraction of a parent's free range withheld from a new child, kept as
/// allocation room for future siblings.
const SIBLING_RESERVE_DENOMINATOR: u64 = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Clone, Debug)]
pub struct ReachabilityData {
    pub interval: Interval,
    pub parent: Option<NodeHandle>,
    pub children: Vec<NodeHandle>,
    pub future_covering_set: Vec<NodeHandle>,
}

#[derive(Default)]
pub struct ReachabilityTree {
    data: HashMap<NodeHandle, ReachabilityData>,
    root: Option<NodeHandle>,
    dirty: HashSet<NodeHandle>,
}

impl ReachabilityTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self, node: NodeHandle) -> Option<&ReachabilityData> {
        self.data.get(&node)
    }

    fn interval_of(&self, node: NodeHandle) -> Result<Interval, DagError> {
        self.data
            .get(&node)
            .map(|data| data.interval)
            .ok_or_else(|| DagError::corruption("missing reachability data"))
    }

    /// Registers a freshly colored block. `selected_parent_anticone` is
    /// the anticone of the block's selected parent, whose members gain
    /// the new block in their future covering sets.
    pub fn add_block(
        &mut self,
        node: NodeHandle,
        selected_parent: Option<NodeHandle>,
        selected_parent_anticone: &[NodeHandle],
    ) -> Result<(), DagError> {
        if self.data.contains_key(&node) {
            return Err(DagError::corruption("block already in reachability tree"));
        }

        let interval = match selected_parent {
            None => {
                if self.root.is_some() {
                    return Err(DagError::corruption(
                        "second parentless block in reachability tree",
                    ));
                }
                self.root = Some(node);
                Interval::new(1, u64::MAX - 1)
            }
            Some(parent) => {
                if self.free_capacity(parent)? < 2 {
                    self.reallocate()?;
                }
                let interval = self.allocate_child_interval(parent)?;
                let parent_data = self
                    .data
                    .get_mut(&parent)
                    .ok_or_else(|| DagError::corruption("missing reachability data"))?;
                parent_data.children.push(node);
                self.dirty.insert(parent);
                interval
            }
        };

        self.data.insert(
            node,
            ReachabilityData {
                interval,
                parent: selected_parent,
                children: Vec::new(),
                future_covering_set: Vec::new(),
            },
        );
        self.dirty.insert(node);

        for &anticone_node in selected_parent_anticone {
            self.insert_to_future_covering_set(anticone_node, node)?;
        }
        Ok(())
    }

    fn free_capacity(&self, parent: NodeHandle) -> Result<u64, DagError> {
        let data = self
            .data
            .get(&parent)
            .ok_or_else(|| DagError::corruption("missing reachability data"))?;
        let free_start = match data.children.last() {
            Some(&last) => self.interval_of(last)?.end,
            None => data.interval.start,
        };
        Ok(data.interval.end - free_start)
    }

    fn allocate_child_interval(&self, parent: NodeHandle) -> Result<Interval, DagError> {
        let data = self
            .data
            .get(&parent)
            .ok_or_else(|| DagError::corruption("missing reachability data"))?;
        let free_start = match data.children.last() {
            Some(&last) => self.interval_of(last)?.end,
            None => data.interval.start,
        };
        let available = data.interval.end - free_start;
        if available < 2 {
            return Err(DagError::corruption(
                "reachability interval space exhausted after reallocation",
            ));
        }
        let reserve = (available / SIBLING_RESERVE_DENOMINATOR).max(1);
        let width = available - reserve;
        Ok(Interval::new(free_start, free_start + width))
    }

    fn insert_to_future_covering_set(
        &mut self,
        node: NodeHandle,
        new_block: NodeHandle,
    ) -> Result<(), DagError> {
        let new_interval = self.interval_of(new_block)?;
        let fcs = &self
            .data
            .get(&node)
            .ok_or_else(|| DagError::corruption("missing reachability data"))?
            .future_covering_set;

        let position = {
            let mut lo = 0usize;
            let mut hi = fcs.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                if self.interval_of(fcs[mid])?.start <= new_interval.start {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            lo
        };

        if position > 0 {
            let candidate = fcs[position - 1];
            let candidate_interval = self.interval_of(candidate)?;
            if candidate_interval.contains(&new_interval) {
                // Already covered by an earlier subtree.
                return Ok(());
            }
            if new_interval.contains(&candidate_interval) {
                let fcs = &mut self
                    .data
                    .get_mut(&node)
                    .expect("presence checked above")
                    .future_covering_set;
                fcs[position - 1] = new_block;
                self.dirty.insert(node);
                return Ok(());
            }
        }

        let fcs = &mut self
            .data
            .get_mut(&node)
            .expect("presence checked above")
            .future_covering_set;
        fcs.insert(position, new_block);
        self.dirty.insert(node);
        Ok(())
    }

    /// Whether `ancestor` is `descendant` or lies on its selected-parent
    /// chain.
    pub fn is_chain_ancestor_of(
        &self,
        ancestor: NodeHandle,
        descendant: NodeHandle,
    ) -> Result<bool, DagError> {
        let ancestor_interval = self.interval_of(ancestor)?;
        let descendant_interval = self.interval_of(descendant)?;
        Ok(ancestor_interval.contains(&descendant_interval))
    }

    /// Whether `node` is in the past of `other` in the DAG sense: a
    /// strict ancestor through any combination of parent edges.
    pub fn is_in_past(&self, node: NodeHandle, other: NodeHandle) -> Result<bool, DagError> {
        if node == other {
            return Ok(false);
        }
        if self.is_chain_ancestor_of(node, other)? {
            return Ok(true);
        }

        let other_interval = self.interval_of(other)?;
        let fcs = &self
            .data
            .get(&node)
            .ok_or_else(|| DagError::corruption("missing reachability data"))?
            .future_covering_set;
        let mut lo = 0usize;
        let mut hi = fcs.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.interval_of(fcs[mid])?.start <= other_interval.start {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            return Ok(false);
        }
        Ok(self.interval_of(fcs[lo - 1])?.contains(&other_interval))
    }

    /// Reassigns every interval, spreading free space proportionally to
    /// subtree sizes. Child order (and with it every interval's relative
    /// position) is preserved, so ancestry answers are unchanged.
    fn reallocate(&mut self) -> Result<(), DagError> {
        let root = self
            .root
            .ok_or_else(|| DagError::corruption("reachability tree has no root"))?;

        // Pre-order walk; children appear after their parent, so a
        // reverse sweep accumulates subtree sizes without recursion.
        let mut order = Vec::with_capacity(self.data.len());
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            order.push(node);
            let data = self
                .data
                .get(&node)
                .ok_or_else(|| DagError::corruption("missing reachability data"))?;
            for &child in data.children.iter().rev() {
                stack.push(child);
            }
        }

        let mut subtree_sizes: HashMap<NodeHandle, u64> = HashMap::with_capacity(order.len());
        for &node in order.iter().rev() {
            let children = &self.data[&node].children;
            let mut size = 1u64;
            for child in children {
                size += subtree_sizes[child];
            }
            subtree_sizes.insert(node, size);
        }

        self.data.get_mut(&root).expect("root present").interval = Interval::new(1, u64::MAX - 1);
        for &node in &order {
            let (interval, children) = {
                let data = &self.data[&node];
                (data.interval, data.children.clone())
            };
            if children.is_empty() {
                self.dirty.insert(node);
                continue;
            }
            let usable = interval.size() - 1;
            let tight_total: u64 = children.iter().map(|child| subtree_sizes[child]).sum();
            let unit = usable / (tight_total + 1);
            if unit < 2 {
                return Err(DagError::corruption(
                    "reachability interval space exhausted",
                ));
            }
            let mut cursor = interval.start;
            for child in children {
                let width = subtree_sizes[&child] * unit;
                self.data.get_mut(&child).expect("child present").interval =
                    Interval::new(cursor, cursor + width);
                cursor += width;
            }
            self.dirty.insert(node);
        }
        Ok(())
    }

    pub fn insert_loaded(&mut self, node: NodeHandle, data: ReachabilityData) {
        if data.parent.is_none() {
            self.root = Some(node);
        }
        self.data.insert(node, data);
    }

    pub fn store_state(&self, nodes: &BlockNodeStore, batch: &mut WriteBatch) {
        for &handle in &self.dirty {
            let data = &self.data[&handle];
            batch.put(
                Column::ReachabilityData,
                nodes.node(handle).hash,
                serialize_reachability_data(nodes, data),
            );
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn serialize_reachability_data(nodes: &BlockNodeStore, data: &ReachabilityData) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u64_le(data.interval.start);
    encoder.write_u64_le(data.interval.end);
    let parent_hash = match data.parent {
        Some(parent) => nodes.node(parent).hash,
        None => ZERO_HASH,
    };
    encoder.write_hash(&parent_hash);
    encoder.write_varint(data.children.len() as u64);
    for &child in &data.children {
        encoder.write_hash(&nodes.node(child).hash);
    }
    encoder.write_varint(data.future_covering_set.len() as u64);
    for &covered in &data.future_covering_set {
        encoder.write_hash(&nodes.node(covered).hash);
    }
    encoder.into_inner()
}

/// Reachability row with hash references, before handle resolution.
#[derive(Clone, Debug)]
pub struct RawReachabilityData {
    pub interval: Interval,
    pub parent_hash: Option<dagd_consensus::Hash256>,
    pub children: Vec<dagd_consensus::Hash256>,
    pub future_covering_set: Vec<dagd_consensus::Hash256>,
}

pub fn deserialize_reachability_data(bytes: &[u8]) -> Result<RawReachabilityData, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let start = decoder.read_u64_le()?;
    let end = decoder.read_u64_le()?;
    let parent_raw = decoder.read_hash()?;
    let parent_hash = if parent_raw == ZERO_HASH {
        None
    } else {
        Some(parent_raw)
    };
    let child_count = decoder.read_varint()? as usize;
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        children.push(decoder.read_hash()?);
    }
    let fcs_count = decoder.read_varint()? as usize;
    let mut future_covering_set = Vec::with_capacity(fcs_count);
    for _ in 0..fcs_count {
        future_covering_set.push(decoder.read_hash()?);
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(RawReachabilityData {
        interval: Interval { start, end },
        parent_hash,
        children,
        future_covering_set,
    })
}
