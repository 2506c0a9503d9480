//! Compact-target conversions and the difficulty rule.

use primitive_types::U256;

use dagd_consensus::Hash256;

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::blockwindow::blue_block_window;
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Whether a block hash satisfies the compact target.
pub fn hash_meets_target(hash: &Hash256, bits: u32) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(false);
    }
    Ok(U256::from_little_endian(hash) <= target)
}

/// Whether `bits` is an acceptable claim at all under the proof-of-work
/// limit.
pub fn bits_in_range(bits: u32, params: &Params) -> bool {
    let Ok(target) = compact_to_u256(bits) else {
        return false;
    };
    let Ok(limit) = compact_to_u256(params.pow_limit_bits) else {
        return false;
    };
    !target.is_zero() && target <= limit
}

/// The required difficulty of a block whose selected parent is
/// `selected_parent`: the average target over the parent's blue window,
/// scaled by how the window's actual timespan compares to the targeted
/// one. While the window is short the proof-of-work limit applies.
pub fn required_difficulty(
    nodes: &BlockNodeStore,
    selected_parent: NodeHandle,
    params: &Params,
) -> Result<u32, CompactError> {
    let window_size = params.difficulty_adjustment_window_size as u64;
    let mut window = blue_block_window(nodes, selected_parent, window_size);
    window.insert(0, selected_parent);
    if (window.len() as u64) <= window_size {
        return Ok(params.pow_limit_bits);
    }

    let mut total = U256::zero();
    for &handle in &window {
        total = total.saturating_add(compact_to_u256(nodes.node(handle).header.bits)?);
    }
    let average = total / U256::from(window.len() as u64);

    let newest = window
        .iter()
        .map(|&h| nodes.node(h).timestamp())
        .max()
        .expect("non-empty window");
    let oldest = window
        .iter()
        .map(|&h| nodes.node(h).timestamp())
        .min()
        .expect("non-empty window");
    let expected_span = (window.len() as i64 - 1) * params.target_time_per_block;
    let mut actual_span = newest - oldest;
    // Dampen to at most a factor of four per retarget.
    actual_span = actual_span.clamp(expected_span / 4, expected_span * 4).max(1);

    let mut next = average / U256::from(expected_span.max(1) as u64);
    next *= U256::from(actual_span as u64);

    let limit = compact_to_u256(params.pow_limit_bits)?;
    if next > limit {
        next = limit;
    }
    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1e7f_ffff, 0x0100_0012] {
            let value = compact_to_u256(bits).expect("decode");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_is_rejected() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn hash_target_comparison() {
        let bits = 0x207f_ffff;
        let low_hash = [0u8; 32];
        assert!(hash_meets_target(&low_hash, bits).expect("check"));
        let mut high_hash = [0xffu8; 32];
        high_hash[31] = 0x7f;
        assert!(!hash_meets_target(&high_hash, bits).expect("check"));
    }

    #[test]
    fn bits_must_stay_under_the_limit() {
        let params = crate::params::Params::mainnet();
        assert!(bits_in_range(params.pow_limit_bits, &params));
        assert!(bits_in_range(0x1d00_ffff, &params));
        assert!(!bits_in_range(0x2100_ffff, &params));
        assert!(!bits_in_range(0, &params));
    }
}
