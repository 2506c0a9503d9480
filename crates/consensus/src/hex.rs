//! Hex conversion for 256-bit hashes.
//!
//! Hashes are stored little-endian but displayed big-endian, so the hex
//! forms read like the numbers they encode.

use crate::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string must encode 32 bytes"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);

    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let hex = hash256_to_hex(&hash);
        assert_eq!(hash256_from_hex(&hex), Ok(hash));
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(hash256_from_hex("abcd"), Err(HexError::InvalidLength));
        let bad = "zz".repeat(32);
        assert_eq!(hash256_from_hex(&bad), Err(HexError::InvalidHex));
    }
}
