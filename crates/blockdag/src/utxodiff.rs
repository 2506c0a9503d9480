//! UTXO diff algebra.
//!
//! A diff is a pair of collections (to-add, to-remove) relative to some
//! base UTXO set. `with_diff` composes two stacked diffs, `diff_from`
//! computes the diff between two sibling diffs over the same base, and
//! `MutableUtxoDiff` supports in-place composition so that restoring a
//! long diff-child chain stays linear.

use dagd_primitives::encoding::{DecodeError, Decoder, Encoder};
use dagd_primitives::outpoint::OutPoint;

use crate::utxo::{UtxoCollection, UtxoEntry};

/// Violation of the diff rules: composing or subtracting diffs that
/// double-add or double-remove the same coin. Diffs only ever come from
/// the core's own bookkeeping, so callers treat this as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffError(pub &'static str);

impl std::fmt::Display for DiffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DiffError {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoDiff {
    pub to_add: UtxoCollection,
    pub to_remove: UtxoCollection,
}

impl UtxoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn clone_mutable(&self) -> MutableUtxoDiff {
        MutableUtxoDiff { inner: self.clone() }
    }

    /// Composes `self` (base→A) with `other` (A→B) into base→B.
    pub fn with_diff(&self, other: &UtxoDiff) -> Result<UtxoDiff, DiffError> {
        let mut result = UtxoDiff::new();

        for (outpoint, entry) in self.to_add.iter() {
            if other
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                return Err(DiffError("both diffs add the same outpoint"));
            }
            if !other
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                result.to_add.add(*outpoint, entry.clone());
            }
        }
        for (outpoint, entry) in other.to_add.iter() {
            if !self
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                if result.to_add.contains(outpoint) {
                    return Err(DiffError("both diffs add the same outpoint"));
                }
                result.to_add.add(*outpoint, entry.clone());
            }
        }

        for (outpoint, entry) in self.to_remove.iter() {
            if other
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                return Err(DiffError("both diffs remove the same outpoint"));
            }
            if !other
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                result.to_remove.add(*outpoint, entry.clone());
            }
        }
        for (outpoint, entry) in other.to_remove.iter() {
            if !self
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                if result.to_remove.contains(outpoint) {
                    return Err(DiffError("both diffs remove the same outpoint"));
                }
                result.to_remove.add(*outpoint, entry.clone());
            }
        }

        Ok(result)
    }

    /// The diff `r` such that `self.with_diff(r)` equals `other`, for
    /// two diffs over the same base.
    pub fn diff_from(&self, other: &UtxoDiff) -> Result<UtxoDiff, DiffError> {
        let mut result = UtxoDiff::new();

        for (outpoint, entry) in other.to_add.iter() {
            if self
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                return Err(DiffError(
                    "one diff removes an outpoint the other diff adds",
                ));
            }
            if !self
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                result.to_add.add(*outpoint, entry.clone());
            }
        }
        for (outpoint, entry) in self.to_remove.iter() {
            if other
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                return Err(DiffError(
                    "one diff removes an outpoint the other diff adds",
                ));
            }
            if !other
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                if result.to_add.contains(outpoint) {
                    return Err(DiffError("diff subtraction adds an outpoint twice"));
                }
                result.to_add.add(*outpoint, entry.clone());
            }
        }

        for (outpoint, entry) in other.to_remove.iter() {
            if !self
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                result.to_remove.add(*outpoint, entry.clone());
            }
        }
        for (outpoint, entry) in self.to_add.iter() {
            if !other
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                if result.to_remove.contains(outpoint) {
                    return Err(DiffError("diff subtraction removes an outpoint twice"));
                }
                result.to_remove.add(*outpoint, entry.clone());
            }
        }

        Ok(result)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.to_add.encode_to(&mut encoder);
        self.to_remove.encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let diff = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(diff)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let to_add = UtxoCollection::decode_from(decoder)?;
        let to_remove = UtxoCollection::decode_from(decoder)?;
        Ok(Self { to_add, to_remove })
    }
}

/// An owning diff that composes in place. Cloning produces a fresh copy,
/// never an alias into shared structures.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutableUtxoDiff {
    inner: UtxoDiff,
}

impl MutableUtxoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_diff(&self) -> &UtxoDiff {
        &self.inner
    }

    pub fn to_immutable(&self) -> UtxoDiff {
        self.inner.clone()
    }

    pub fn into_immutable(self) -> UtxoDiff {
        self.inner
    }

    /// In-place equivalent of `UtxoDiff::with_diff`; removals first so a
    /// coin that `other` re-creates at a new blue score nets correctly.
    pub fn with_diff_in_place(&mut self, other: &UtxoDiff) -> Result<(), DiffError> {
        for (outpoint, entry) in other.to_remove.iter() {
            if self
                .inner
                .to_add
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                self.inner.to_add.remove(outpoint);
            } else if self.inner.to_remove.contains(outpoint) {
                return Err(DiffError("both diffs remove the same outpoint"));
            } else {
                self.inner.to_remove.add(*outpoint, entry.clone());
            }
        }
        for (outpoint, entry) in other.to_add.iter() {
            if self
                .inner
                .to_remove
                .contains_with_blue_score(outpoint, entry.block_blue_score)
            {
                self.inner.to_remove.remove(outpoint);
            } else if self.inner.to_add.contains(outpoint) {
                return Err(DiffError("both diffs add the same outpoint"));
            } else {
                self.inner.to_add.add(*outpoint, entry.clone());
            }
        }
        Ok(())
    }

    pub fn add_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), DiffError> {
        if self
            .inner
            .to_remove
            .contains_with_blue_score(&outpoint, entry.block_blue_score)
        {
            self.inner.to_remove.remove(&outpoint);
        } else if self.inner.to_add.contains(&outpoint) {
            return Err(DiffError("cannot add the same outpoint twice"));
        } else {
            self.inner.to_add.add(outpoint, entry);
        }
        Ok(())
    }

    pub fn remove_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), DiffError> {
        if self
            .inner
            .to_add
            .contains_with_blue_score(&outpoint, entry.block_blue_score)
        {
            self.inner.to_add.remove(&outpoint);
        } else if self.inner.to_remove.contains(&outpoint) {
            return Err(DiffError("cannot remove the same outpoint twice"));
        } else {
            self.inner.to_remove.add(outpoint, entry);
        }
        Ok(())
    }
}

impl From<UtxoDiff> for MutableUtxoDiff {
    fn from(inner: UtxoDiff) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outpoint(tag: u8) -> OutPoint {
        OutPoint::new([tag; 32], 0)
    }

    fn entry(blue_score: u64) -> UtxoEntry {
        UtxoEntry {
            amount: 100,
            script_pub_key: vec![0x51],
            block_blue_score: blue_score,
            is_coinbase: false,
        }
    }

    fn diff_adding(tags: &[u8]) -> UtxoDiff {
        let mut diff = UtxoDiff::new();
        for &tag in tags {
            diff.to_add.add(outpoint(tag), entry(1));
        }
        diff
    }

    #[test]
    fn with_diff_identity() {
        let diff = diff_adding(&[1, 2]);
        let composed = diff.with_diff(&UtxoDiff::new()).expect("compose");
        assert_eq!(composed, diff);
    }

    #[test]
    fn with_diff_cancels_add_remove_pairs() {
        let mut first = UtxoDiff::new();
        first.to_add.add(outpoint(1), entry(5));
        let mut second = UtxoDiff::new();
        second.to_remove.add(outpoint(1), entry(5));
        let composed = first.with_diff(&second).expect("compose");
        assert!(composed.is_empty());
    }

    #[test]
    fn with_diff_rejects_double_add_and_double_remove() {
        let first = diff_adding(&[1]);
        assert!(first.with_diff(&first).is_err());

        let mut removal = UtxoDiff::new();
        removal.to_remove.add(outpoint(2), entry(1));
        assert!(removal.with_diff(&removal).is_err());
    }

    #[test]
    fn with_diff_distinguishes_blue_scores() {
        // The same outpoint removed at score 5 and re-added at score 9.
        let mut first = UtxoDiff::new();
        first.to_remove.add(outpoint(1), entry(5));
        let mut second = UtxoDiff::new();
        second.to_add.add(outpoint(1), entry(9));
        let composed = first.with_diff(&second).expect("compose");
        assert!(composed.to_remove.contains_with_blue_score(&outpoint(1), 5));
        assert!(composed.to_add.contains_with_blue_score(&outpoint(1), 9));
    }

    #[test]
    fn diff_from_round_trips_through_with_diff() {
        let mut d = UtxoDiff::new();
        d.to_add.add(outpoint(1), entry(1));
        d.to_add.add(outpoint(2), entry(2));
        d.to_remove.add(outpoint(3), entry(3));

        let mut e = UtxoDiff::new();
        e.to_add.add(outpoint(2), entry(2));
        e.to_add.add(outpoint(4), entry(4));
        e.to_remove.add(outpoint(3), entry(3));
        e.to_remove.add(outpoint(5), entry(5));

        let r = d.diff_from(&e).expect("diff_from");
        let composed = d.with_diff(&r).expect("with_diff");
        assert_eq!(composed, e);
    }

    #[test]
    fn in_place_composition_matches_pure_composition() {
        let mut d = UtxoDiff::new();
        d.to_add.add(outpoint(1), entry(1));
        d.to_remove.add(outpoint(2), entry(2));

        let mut e = UtxoDiff::new();
        e.to_add.add(outpoint(2), entry(2));
        e.to_add.add(outpoint(3), entry(3));
        e.to_remove.add(outpoint(1), entry(1));

        let pure = d.with_diff(&e).expect("with_diff");
        let mut in_place = d.clone_mutable();
        in_place.with_diff_in_place(&e).expect("in place");
        assert_eq!(in_place.to_immutable(), pure);
    }

    #[test]
    fn add_then_remove_entry_nets_out() {
        let mut diff = MutableUtxoDiff::new();
        diff.add_entry(outpoint(1), entry(7)).expect("add");
        diff.remove_entry(outpoint(1), entry(7)).expect("remove");
        assert!(diff.as_diff().is_empty());
    }

    #[test]
    fn diff_serialization_round_trip() {
        let mut diff = UtxoDiff::new();
        diff.to_add.add(outpoint(1), entry(1));
        diff.to_add.add(outpoint(2), entry(9));
        diff.to_remove.add(outpoint(3), entry(3));
        let decoded = UtxoDiff::decode(&diff.encode()).expect("decode");
        assert_eq!(decoded, diff);
    }
}
