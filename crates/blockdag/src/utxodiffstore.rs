//! Per-block UTXO diffs and the diff-child relation.
//!
//! Every connected block stores the diff that maps its diff-child's
//! past-UTXO (or the virtual's full set, for tips) to its own past-UTXO.
//! Restoring any block's past-UTXO walks the diff-child chain toward the
//! virtual and composes the diffs back down.

use std::collections::{HashMap, HashSet};

use dagd_consensus::ZERO_HASH;
use dagd_primitives::encoding::{DecodeError, Decoder, Encoder};
use dagd_storage::{Column, WriteBatch};

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::error::DagError;
use crate::utxodiff::UtxoDiff;

#[derive(Clone, Debug)]
struct DiffData {
    diff: UtxoDiff,
    diff_child: Option<NodeHandle>,
}

#[derive(Default)]
pub struct UtxoDiffStore {
    loaded: HashMap<NodeHandle, DiffData>,
    dirty: HashSet<NodeHandle>,
}

impl UtxoDiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_block_diff(&mut self, node: NodeHandle, diff: UtxoDiff) {
        match self.loaded.get_mut(&node) {
            Some(data) => data.diff = diff,
            None => {
                self.loaded.insert(
                    node,
                    DiffData {
                        diff,
                        diff_child: None,
                    },
                );
            }
        }
        self.dirty.insert(node);
    }

    pub fn set_block_diff_child(
        &mut self,
        node: NodeHandle,
        diff_child: NodeHandle,
    ) -> Result<(), DagError> {
        let data = self
            .loaded
            .get_mut(&node)
            .ok_or_else(|| DagError::corruption("setting diff child before diff"))?;
        data.diff_child = Some(diff_child);
        self.dirty.insert(node);
        Ok(())
    }

    pub fn diff_by_node(&self, node: NodeHandle) -> Result<&UtxoDiff, DagError> {
        self.loaded
            .get(&node)
            .map(|data| &data.diff)
            .ok_or_else(|| DagError::corruption("missing UTXO diff data"))
    }

    pub fn diff_child_by_node(&self, node: NodeHandle) -> Option<NodeHandle> {
        self.loaded.get(&node).and_then(|data| data.diff_child)
    }

    pub fn has_diff_data(&self, node: NodeHandle) -> bool {
        self.loaded.contains_key(&node)
    }

    pub fn insert_loaded(&mut self, node: NodeHandle, diff: UtxoDiff, diff_child: Option<NodeHandle>) {
        self.loaded.insert(node, DiffData { diff, diff_child });
    }

    pub fn flush_to_batch(&self, nodes: &BlockNodeStore, batch: &mut WriteBatch) {
        for &handle in &self.dirty {
            let data = &self.loaded[&handle];
            batch.put(
                Column::UtxoDiffs,
                nodes.node(handle).hash,
                serialize_diff_data(nodes, data),
            );
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Drops in-memory diff data of finalized blocks. Their persisted
    /// blobs are deleted separately by the finalization worker; nothing
    /// below the finality point is restored again.
    pub fn clear_old_entries(&mut self, nodes: &BlockNodeStore) {
        let dirty = &self.dirty;
        self.loaded
            .retain(|&handle, _| dirty.contains(&handle) || !nodes.node(handle).is_finalized());
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }
}

fn serialize_diff_data(nodes: &BlockNodeStore, data: &DiffData) -> Vec<u8> {
    let mut encoder = Encoder::new();
    let child_hash = match data.diff_child {
        Some(child) => nodes.node(child).hash,
        None => ZERO_HASH,
    };
    encoder.write_hash(&child_hash);
    encoder.write_bytes(&data.diff.encode());
    encoder.into_inner()
}

/// A UTXO-diff row with its diff-child still a hash reference.
#[derive(Clone, Debug)]
pub struct RawDiffData {
    pub diff: UtxoDiff,
    pub diff_child_hash: Option<dagd_consensus::Hash256>,
}

pub fn deserialize_diff_data(bytes: &[u8]) -> Result<RawDiffData, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let child_raw = decoder.read_hash()?;
    let diff_child_hash = if child_raw == ZERO_HASH {
        None
    } else {
        Some(child_raw)
    };
    let diff = UtxoDiff::decode_from(&mut decoder)?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(RawDiffData {
        diff,
        diff_child_hash,
    })
}
