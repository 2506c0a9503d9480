//! ECMH multiset commitment over secp256k1.
//!
//! Each element hashes onto a curve point by try-and-increment; the
//! multiset is the running point sum, so insertion order never matters
//! and `add` and `remove` cancel exactly. The empty multiset is the
//! point at infinity and finalizes to the zero hash.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use secp256k1::{All, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use dagd_consensus::{Hash256, ZERO_HASH};
use dagd_storage::{Column, WriteBatch};

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::error::DagError;

fn secp() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Multiset {
    point: Option<PublicKey>,
}

impl Default for Multiset {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiset {
    pub fn new() -> Self {
        Self { point: None }
    }

    pub fn add(&mut self, data: &[u8]) {
        let point = hash_to_point(data);
        self.combine(point);
    }

    pub fn remove(&mut self, data: &[u8]) {
        let point = hash_to_point(data).negate(secp());
        self.combine(point);
    }

    fn combine(&mut self, point: PublicKey) {
        self.point = match self.point {
            None => Some(point),
            // `combine` only fails when the sum is the point at
            // infinity, which is exactly the empty multiset.
            Some(current) => current.combine(&point).ok(),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.point.is_none()
    }

    pub fn finalize_hash(&self) -> Hash256 {
        match &self.point {
            None => ZERO_HASH,
            Some(point) => {
                let digest = Sha256::digest(point.serialize());
                let mut out = [0u8; 32];
                out.copy_from_slice(&digest);
                out
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match &self.point {
            None => vec![0u8],
            Some(point) => {
                let mut out = Vec::with_capacity(34);
                out.push(1u8);
                out.extend_from_slice(&point.serialize());
                out
            }
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, DagError> {
        match bytes.split_first() {
            Some((0, rest)) if rest.is_empty() => Ok(Self { point: None }),
            Some((1, rest)) if rest.len() == 33 => {
                let point = PublicKey::from_slice(rest)
                    .map_err(|_| DagError::corruption("invalid multiset point"))?;
                Ok(Self { point: Some(point) })
            }
            _ => Err(DagError::corruption("invalid multiset serialization")),
        }
    }
}

/// Maps arbitrary bytes onto a curve point: candidate x-coordinates are
/// drawn from sha256(counter ‖ sha256(data)) until one lifts onto the
/// curve (even-y branch).
fn hash_to_point(data: &[u8]) -> PublicKey {
    let inner: [u8; 32] = Sha256::digest(data).into();
    let mut counter = 0u64;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(inner);
        let candidate: [u8; 32] = hasher.finalize().into();
        let mut compressed = [0u8; 33];
        compressed[0] = 0x02;
        compressed[1..].copy_from_slice(&candidate);
        if let Ok(point) = PublicKey::from_slice(&compressed) {
            return point;
        }
        counter += 1;
    }
}

/// Per-block multisets, flushed with the rest of the acceptance batch.
#[derive(Default)]
pub struct MultisetStore {
    loaded: HashMap<NodeHandle, Multiset>,
    new_entries: HashSet<NodeHandle>,
}

impl MultisetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_multiset(&mut self, node: NodeHandle, multiset: Multiset) {
        self.loaded.insert(node, multiset);
        self.new_entries.insert(node);
    }

    pub fn multiset_of(&self, node: NodeHandle) -> Result<&Multiset, DagError> {
        self.loaded
            .get(&node)
            .ok_or_else(|| DagError::corruption("missing multiset data"))
    }

    pub fn insert_loaded(&mut self, node: NodeHandle, multiset: Multiset) {
        self.loaded.insert(node, multiset);
    }

    pub fn flush_to_batch(&self, nodes: &BlockNodeStore, batch: &mut WriteBatch) {
        for &handle in &self.new_entries {
            batch.put(
                Column::Multisets,
                nodes.node(handle).hash,
                self.loaded[&handle].serialize(),
            );
        }
    }

    pub fn clear_new_entries(&mut self) {
        self.new_entries.clear();
    }
}
