//! In-memory block index: an arena of block nodes addressed by stable
//! handles, plus the persisted metadata for each node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use dagd_consensus::{hash_less, Hash256, KType, ZERO_HASH};
use dagd_primitives::block::BlockHeader;
use dagd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use dagd_storage::{Column, WriteBatch};

pub const STATUS_DATA_STORED: u8 = 1 << 0;
pub const STATUS_VALID: u8 = 1 << 1;
pub const STATUS_VALIDATE_FAILED: u8 = 1 << 2;
pub const STATUS_INVALID_ANCESTOR: u8 = 1 << 3;

pub fn status_known_invalid(status: u8) -> bool {
    (status & (STATUS_VALIDATE_FAILED | STATUS_INVALID_ANCESTOR)) != 0
}

pub fn status_known_valid(status: u8) -> bool {
    (status & STATUS_VALID) != 0
}

/// Stable index of a block node inside the arena. Handles are only
/// meaningful within one process lifetime; persisted references are
/// always hashes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct BlockNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub parents: Vec<NodeHandle>,
    pub children: Vec<NodeHandle>,
    pub selected_parent: Option<NodeHandle>,
    /// Blue blocks in this node's selected-parent anticone, selected
    /// parent first.
    pub blues: Vec<NodeHandle>,
    pub blues_anticone_sizes: HashMap<NodeHandle, KType>,
    pub blue_score: u64,
    status: u8,
    finalized: AtomicBool,
}

impl BlockNode {
    pub fn new(
        hash: Hash256,
        header: BlockHeader,
        parents: Vec<NodeHandle>,
        selected_parent: Option<NodeHandle>,
        blues: Vec<NodeHandle>,
        blues_anticone_sizes: HashMap<NodeHandle, KType>,
        blue_score: u64,
        status: u8,
    ) -> Self {
        Self {
            hash,
            header,
            parents,
            children: Vec::new(),
            selected_parent,
            blues,
            blues_anticone_sizes,
            blue_score,
            status,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Finality flips from the background worker while readers hold the
    /// DAG lock shared, hence the atomic.
    pub fn set_finalized(&self) {
        self.finalized.store(true, Ordering::Relaxed);
    }

    /// Orders nodes by (blue score, hash), the DAG-wide tie-break rule.
    pub fn is_less_than(&self, other: &BlockNode) -> bool {
        if self.blue_score == other.blue_score {
            return hash_less(&self.hash, &other.hash);
        }
        self.blue_score < other.blue_score
    }
}

pub struct BlockNodeStore {
    nodes: Vec<BlockNode>,
    index: Mutex<HashMap<Hash256, NodeHandle>>,
    dirty: HashSet<NodeHandle>,
}

impl Default for BlockNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockNodeStore {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: Mutex::new(HashMap::new()),
            dirty: HashSet::new(),
        }
    }

    pub fn insert(&mut self, node: BlockNode) -> NodeHandle {
        let handle = NodeHandle(self.nodes.len() as u32);
        self.index
            .lock()
            .expect("block index lock")
            .insert(node.hash, handle);
        self.nodes.push(node);
        self.dirty.insert(handle);
        handle
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeHandle> {
        self.index.lock().expect("block index lock").get(hash).copied()
    }

    pub fn node(&self, handle: NodeHandle) -> &BlockNode {
        &self.nodes[handle.index()]
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> &mut BlockNode {
        self.dirty.insert(handle);
        &mut self.nodes[handle.index()]
    }

    pub fn node_status(&self, handle: NodeHandle) -> u8 {
        self.nodes[handle.index()].status
    }

    pub fn set_status(&mut self, handle: NodeHandle, status: u8) {
        self.nodes[handle.index()].status = status;
        self.dirty.insert(handle);
    }

    pub fn add_status_flags(&mut self, handle: NodeHandle, flags: u8) {
        self.nodes[handle.index()].status |= flags;
        self.dirty.insert(handle);
    }

    /// Adds `node` to the children list of each of its parents.
    pub fn update_parents_children(&mut self, handle: NodeHandle) {
        let parents = self.nodes[handle.index()].parents.clone();
        for parent in parents {
            if !self.nodes[parent.index()].children.contains(&handle) {
                self.nodes[parent.index()].children.push(handle);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn for_each_hash(&self, mut visitor: impl FnMut(&Hash256, NodeHandle)) {
        for (index, node) in self.nodes.iter().enumerate() {
            visitor(&node.hash, NodeHandle(index as u32));
        }
    }

    /// The handle of the bluest node among `candidates`: highest blue
    /// score, ties resolved toward the larger hash.
    pub fn bluest(&self, candidates: &[NodeHandle]) -> Option<NodeHandle> {
        let mut best: Option<NodeHandle> = None;
        for &candidate in candidates {
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if self.node(current).is_less_than(self.node(candidate)) {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    pub fn flush_to_batch(&self, batch: &mut WriteBatch) {
        for &handle in &self.dirty {
            let node = &self.nodes[handle.index()];
            batch.put(
                Column::BlockIndex,
                block_index_key(node.blue_score, &node.hash),
                self.serialize_node(node),
            );
        }
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Called only after the enclosing batch has committed.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    fn serialize_node(&self, node: &BlockNode) -> Vec<u8> {
        let mut encoder = Encoder::new();
        node.header.consensus_encode(&mut encoder);
        encoder.write_u8(node.status);
        let selected_parent_hash = match node.selected_parent {
            Some(parent) => self.nodes[parent.index()].hash,
            None => ZERO_HASH,
        };
        encoder.write_hash(&selected_parent_hash);
        encoder.write_u64_le(node.blue_score);
        encoder.write_varint(node.blues.len() as u64);
        for &blue in &node.blues {
            encoder.write_hash(&self.nodes[blue.index()].hash);
        }
        encoder.write_varint(node.blues_anticone_sizes.len() as u64);
        let mut sizes: Vec<(Hash256, KType)> = node
            .blues_anticone_sizes
            .iter()
            .map(|(&blue, &size)| (self.nodes[blue.index()].hash, size))
            .collect();
        sizes.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (hash, size) in sizes {
            encoder.write_hash(&hash);
            encoder.write_u8(size);
        }
        encoder.into_inner()
    }
}

/// Block index key: big-endian blue score followed by the block hash, so
/// that cursors iterate blocks in blue-score order.
pub fn block_index_key(blue_score: u64, hash: &Hash256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&blue_score.to_be_bytes());
    key[8..].copy_from_slice(hash);
    key
}

pub fn hash_from_block_index_key(key: &[u8]) -> Option<Hash256> {
    if key.len() != 40 {
        return None;
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&key[8..]);
    Some(hash)
}

/// A block-index row decoded into hash references, before the hashes
/// are resolved into arena handles.
#[derive(Clone, Debug)]
pub struct RawBlockNode {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub status: u8,
    pub selected_parent_hash: Option<Hash256>,
    pub blue_score: u64,
    pub blues: Vec<Hash256>,
    pub blues_anticone_sizes: Vec<(Hash256, KType)>,
}

pub fn deserialize_block_node(bytes: &[u8]) -> Result<RawBlockNode, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let header = BlockHeader::consensus_decode(&mut decoder)?;
    let status = decoder.read_u8()?;
    let selected_parent_raw = decoder.read_hash()?;
    let selected_parent_hash = if selected_parent_raw == ZERO_HASH {
        None
    } else {
        Some(selected_parent_raw)
    };
    let blue_score = decoder.read_u64_le()?;
    let blues_count = decoder.read_varint()? as usize;
    let mut blues = Vec::with_capacity(blues_count);
    for _ in 0..blues_count {
        blues.push(decoder.read_hash()?);
    }
    let sizes_count = decoder.read_varint()? as usize;
    let mut blues_anticone_sizes = Vec::with_capacity(sizes_count);
    for _ in 0..sizes_count {
        let hash = decoder.read_hash()?;
        let size = decoder.read_u8()?;
        blues_anticone_sizes.push((hash, size));
    }
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(RawBlockNode {
        hash: header.hash(),
        header,
        status,
        selected_parent_hash,
        blue_score,
        blues,
        blues_anticone_sizes,
    })
}
