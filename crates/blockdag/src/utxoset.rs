//! Full and diff-layered UTXO sets.
//!
//! The base full UTXO set is owned behind its own reader-writer lock
//! (the utxo-lock); a `DiffUtxoSet` layers a mutable diff over a shared
//! handle to it. Melding folds the accumulated diff into the base and is
//! the only operation that takes the utxo-lock for writing.

use std::sync::{Arc, RwLock};

use dagd_primitives::outpoint::OutPoint;
use dagd_primitives::transaction::Transaction;

use crate::error::DagError;
use crate::multiset::Multiset;
use crate::utxo::{serialize_utxo, UtxoCollection, UtxoEntry};
use crate::utxodiff::{MutableUtxoDiff, UtxoDiff};

#[derive(Debug, Default)]
pub struct FullUtxoSet {
    pub collection: UtxoCollection,
}

impl FullUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.collection.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.collection.contains(outpoint)
    }

    pub fn len(&self) -> usize {
        self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collection.is_empty()
    }
}

pub type SharedUtxoSet = Arc<RwLock<FullUtxoSet>>;

pub fn shared_utxo_set(set: FullUtxoSet) -> SharedUtxoSet {
    Arc::new(RwLock::new(set))
}

/// A UTXO set expressed as a diff over the shared base set.
#[derive(Debug)]
pub struct DiffUtxoSet {
    base: SharedUtxoSet,
    diff: MutableUtxoDiff,
}

impl Clone for DiffUtxoSet {
    fn clone(&self) -> Self {
        Self {
            base: Arc::clone(&self.base),
            diff: self.diff.clone(),
        }
    }
}

impl DiffUtxoSet {
    pub fn new(base: SharedUtxoSet, diff: MutableUtxoDiff) -> Self {
        Self { base, diff }
    }

    pub fn base(&self) -> &SharedUtxoSet {
        &self.base
    }

    pub fn diff(&self) -> &UtxoDiff {
        self.diff.as_diff()
    }

    pub fn diff_mut(&mut self) -> &mut MutableUtxoDiff {
        &mut self.diff
    }

    pub fn into_diff(self) -> MutableUtxoDiff {
        self.diff
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if let Some(entry) = self.diff.as_diff().to_add.get(outpoint) {
            return Some(entry.clone());
        }
        let base = self.base.read().expect("utxo lock");
        match base.get(outpoint) {
            Some(entry) if !self.diff.as_diff().to_remove.contains(outpoint) => {
                Some(entry.clone())
            }
            _ => None,
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        if self.diff.as_diff().to_add.contains(outpoint) {
            return true;
        }
        if self.diff.as_diff().to_remove.contains(outpoint) {
            return false;
        }
        self.base.read().expect("utxo lock").contains(outpoint)
    }

    /// Attempts to apply a transaction on top of this set. Returns
    /// `Ok(false)` when an input is missing (the transaction is simply
    /// not accepted), updating nothing. When the transaction applies,
    /// spent entries leave the set, created entries join it, and the
    /// multiset (when given) absorbs the same mutations.
    pub fn add_tx(
        &mut self,
        tx: &Transaction,
        block_blue_score: u64,
        mut multiset: Option<&mut Multiset>,
    ) -> Result<bool, DagError> {
        let mut spent: Vec<(OutPoint, UtxoEntry)> = Vec::with_capacity(tx.inputs.len());
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                match self.get(&input.previous_outpoint) {
                    Some(entry) => spent.push((input.previous_outpoint, entry)),
                    None => return Ok(false),
                }
            }
        }

        for (outpoint, entry) in spent {
            if let Some(ms) = multiset.as_deref_mut() {
                ms.remove(&serialize_utxo(&outpoint, &entry));
            }
            self.diff
                .remove_entry(outpoint, entry)
                .map_err(|err| DagError::corruption(err.to_string()))?;
        }

        let tx_id = tx.id();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx_id, index as u32);
            let entry = UtxoEntry {
                amount: output.value,
                script_pub_key: output.script_pub_key.clone(),
                block_blue_score,
                is_coinbase,
            };
            if let Some(ms) = multiset.as_deref_mut() {
                ms.add(&serialize_utxo(&outpoint, &entry));
            }
            self.diff
                .add_entry(outpoint, entry)
                .map_err(|err| DagError::corruption(err.to_string()))?;
        }

        Ok(true)
    }

    /// The diff between this set's state and `other`'s, both over the
    /// same base.
    pub fn diff_from(&self, other: &DiffUtxoSet) -> Result<UtxoDiff, DagError> {
        self.diff
            .as_diff()
            .diff_from(other.diff.as_diff())
            .map_err(|err| DagError::corruption(err.to_string()))
    }

    /// Folds the accumulated diff into the base full UTXO set. Holds the
    /// utxo-lock exclusively so readers never observe a half-applied
    /// meld.
    pub fn meld_to_base(self) -> Result<UtxoDiff, DagError> {
        let diff = self.diff.into_immutable();
        let mut base = self.base.write().expect("utxo lock");
        for (outpoint, entry) in diff.to_remove.iter() {
            if !base
                .collection
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                return Err(DagError::corruption(
                    "melding a diff that removes a missing outpoint",
                ));
            }
            base.collection.remove(outpoint);
        }
        for (outpoint, entry) in diff.to_add.iter() {
            if base.collection.contains(outpoint) {
                return Err(DagError::corruption(
                    "melding a diff that re-adds an existing outpoint",
                ));
            }
            base.collection.add(*outpoint, entry.clone());
        }
        drop(base);
        Ok(diff)
    }
}
