//! Collaborator interfaces consumed by the consensus core, and the
//! relay-list hand-off toward the network layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use dagd_consensus::constants::MAX_INV_PER_TX_INV_MSG;
use dagd_consensus::Hash256;
use dagd_primitives::block::Block;
use dagd_primitives::transaction::Transaction;
use dagd_storage::WriteBatch;

use crate::acceptance::MultiBlockTxsAcceptanceData;
use crate::error::DagError;
use crate::utxo::UtxoEntry;

/// Adjusted wall clock, in unix milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The system clock plus an adjustable offset fed by the network layer's
/// time samples.
#[derive(Default)]
pub struct SystemTimeSource {
    offset_ms: AtomicI64,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offset_ms(&self, offset: i64) {
        self.offset_ms.store(offset, Ordering::Relaxed);
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        now + self.offset_ms.load(Ordering::Relaxed)
    }
}

/// Signature-script execution seam. The core invokes the verifier per
/// input during block connection; the implementation lives outside the
/// core.
pub trait ScriptVerifier: Send + Sync {
    fn verify_input(
        &self,
        tx: &Transaction,
        input_index: usize,
        utxo_entry: &UtxoEntry,
    ) -> Result<(), &'static str>;
}

/// Memoization table for signature verification results, shared with
/// whatever `ScriptVerifier` the node wires in. May be absent.
pub struct SigCache {
    entries: Mutex<HashMap<Hash256, bool>>,
    max_entries: usize,
}

impl SigCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries,
        }
    }

    pub fn lookup(&self, sig_hash: &Hash256) -> Option<bool> {
        self.entries
            .lock()
            .expect("sig cache lock")
            .get(sig_hash)
            .copied()
    }

    pub fn insert(&self, sig_hash: Hash256, valid: bool) {
        let mut entries = self.entries.lock().expect("sig cache lock");
        if entries.len() >= self.max_entries {
            // Full: drop an arbitrary entry. The cache is a pure
            // memoization table, any eviction is correct.
            if let Some(&victim) = entries.keys().next() {
                entries.remove(&victim);
            }
        }
        entries.insert(sig_hash, valid);
    }
}

/// Optional index layers (tx index, acceptance index) that persist their
/// rows inside the block-acceptance batch.
pub trait IndexManager: Send + Sync {
    fn init(&self) -> Result<(), DagError>;
    fn connect_block(
        &self,
        batch: &mut WriteBatch,
        block_hash: &Hash256,
        acceptance_data: &MultiBlockTxsAcceptanceData,
    ) -> Result<(), DagError>;
}

/// The mempool's view of a newly accepted block.
pub trait Mempool: Send + Sync {
    /// Updates the pool for the new block and returns the IDs of
    /// transactions newly accepted into the pool.
    fn handle_new_block(&self, block: &Block) -> Vec<Hash256>;
    /// IDs the node wants rebroadcast.
    fn transactions_to_rebroadcast(&self) -> Vec<Hash256>;
}

/// The inventory list relayed after a new block: the freshly accepted
/// IDs first, rebroadcast IDs appended after them, bounded by the
/// inventory message limit.
pub fn build_relay_list(accepted: Vec<Hash256>, rebroadcast: Vec<Hash256>) -> Vec<Hash256> {
    let mut list = accepted;
    list.extend(rebroadcast);
    list.truncate(MAX_INV_PER_TX_INV_MSG);
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_list_appends_rebroadcast_after_accepted() {
        let accepted = vec![[1u8; 32], [2u8; 32]];
        let rebroadcast = vec![[3u8; 32], [4u8; 32]];
        let list = build_relay_list(accepted, rebroadcast);
        assert_eq!(list, vec![[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]]);
    }

    #[test]
    fn relay_list_is_bounded() {
        let accepted: Vec<Hash256> = (0..MAX_INV_PER_TX_INV_MSG)
            .map(|i| {
                let mut hash = [0u8; 32];
                hash[..8].copy_from_slice(&(i as u64).to_le_bytes());
                hash
            })
            .collect();
        let list = build_relay_list(accepted, vec![[0xffu8; 32]]);
        assert_eq!(list.len(), MAX_INV_PER_TX_INV_MSG);
        assert!(!list.contains(&[0xffu8; 32]));
    }

    #[test]
    fn sig_cache_memoizes_and_bounds() {
        let cache = SigCache::new(2);
        cache.insert([1u8; 32], true);
        cache.insert([2u8; 32], false);
        assert_eq!(cache.lookup(&[1u8; 32]), Some(true));
        assert_eq!(cache.lookup(&[2u8; 32]), Some(false));
        cache.insert([3u8; 32], true);
        let cached = [[1u8; 32], [2u8; 32], [3u8; 32]]
            .iter()
            .filter(|hash| cache.lookup(hash).is_some())
            .count();
        assert_eq!(cached, 2);
    }
}
