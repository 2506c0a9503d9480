//! Consensus-wide primitive types and constants.

pub mod constants;
pub mod hex;
pub mod money;

pub use hex::{hash256_from_hex, hash256_to_hex, HexError};
pub use money::{money_range, Amount, MAX_SOMPI, SOMPI_PER_COIN};

/// A 256-bit hash stored in little-endian byte order.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

/// Width type of a blue anticone. Bounded by `k + 1`, so a byte suffices.
pub type KType = u8;

/// Compares two hashes as little-endian 256-bit integers.
pub fn hash_cmp(a: &Hash256, b: &Hash256) -> std::cmp::Ordering {
    for i in (0..32).rev() {
        match a[i].cmp(&b[i]) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

pub fn hash_less(a: &Hash256, b: &Hash256) -> bool {
    hash_cmp(a, b) == std::cmp::Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ordering_is_numeric_little_endian() {
        let mut low = ZERO_HASH;
        let mut high = ZERO_HASH;
        low[0] = 0xff;
        high[31] = 0x01;
        assert!(hash_less(&low, &high));
        assert!(!hash_less(&high, &low));
        assert!(!hash_less(&low, &low));
    }
}
