//! Transaction outpoint type.

use dagd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

pub const OUTPOINT_LEN: usize = 36;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: Hash256, index: u32) -> Self {
        Self { tx_id, index }
    }

    /// Fixed-width key form, used by the UTXO column and the multiset.
    pub fn key_bytes(&self) -> [u8; OUTPOINT_LEN] {
        let mut bytes = [0u8; OUTPOINT_LEN];
        bytes[..32].copy_from_slice(&self.tx_id);
        bytes[32..].copy_from_slice(&self.index.to_le_bytes());
        bytes
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != OUTPOINT_LEN {
            return None;
        }
        let mut tx_id = [0u8; 32];
        tx_id.copy_from_slice(&bytes[..32]);
        let index = u32::from_le_bytes(bytes[32..].try_into().ok()?);
        Some(Self { tx_id, index })
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.tx_id);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let tx_id = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { tx_id, index })
    }
}
