//! Double-SHA256 merkle trees over transaction hashes and IDs.

use dagd_consensus::{hash_cmp, Hash256, ZERO_HASH};

use crate::hash::sha256d;
use crate::transaction::Transaction;

/// Root over the full transaction hashes, committed by `hash_merkle_root`.
pub fn hash_merkle_root(transactions: &[Transaction]) -> Hash256 {
    merkle_root(transactions.iter().map(|tx| tx.hash()).collect())
}

/// Root over the sorted IDs of accepted transactions, committed by
/// `accepted_id_merkle_root`.
pub fn accepted_id_merkle_root(mut accepted_ids: Vec<Hash256>) -> Hash256 {
    accepted_ids.sort_unstable_by(|a, b| hash_cmp(a, b));
    merkle_root(accepted_ids)
}

fn merkle_root(mut level: Vec<Hash256>) -> Hash256 {
    if level.is_empty() {
        return ZERO_HASH;
    }
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().expect("non-empty level");
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            let mut concat = [0u8; 64];
            concat[..32].copy_from_slice(&pair[0]);
            concat[32..].copy_from_slice(&pair[1]);
            next.push(sha256d(&concat));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(merkle_root(Vec::new()), ZERO_HASH);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = [9u8; 32];
        assert_eq!(merkle_root(vec![leaf]), leaf);
    }

    #[test]
    fn odd_level_duplicates_last() {
        let leaves = vec![[1u8; 32], [2u8; 32], [3u8; 32]];
        let with_dup = vec![[1u8; 32], [2u8; 32], [3u8; 32], [3u8; 32]];
        assert_eq!(merkle_root(leaves), merkle_root(with_dup));
    }

    #[test]
    fn accepted_root_is_order_independent() {
        let ids = vec![[5u8; 32], [1u8; 32], [9u8; 32]];
        let mut reversed = ids.clone();
        reversed.reverse();
        assert_eq!(
            accepted_id_merkle_root(ids),
            accepted_id_merkle_root(reversed)
        );
    }
}
