//! Subnetwork identifiers.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

pub const SUBNETWORK_ID_LEN: usize = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SubnetworkId(pub [u8; SUBNETWORK_ID_LEN]);

/// Ordinary value-transfer transactions.
pub const SUBNETWORK_ID_NATIVE: SubnetworkId = SubnetworkId([0u8; SUBNETWORK_ID_LEN]);
/// Coinbase transactions.
pub const SUBNETWORK_ID_COINBASE: SubnetworkId = subnetwork_from_byte(1);
/// Transactions that register a new subnetwork.
pub const SUBNETWORK_ID_REGISTRY: SubnetworkId = subnetwork_from_byte(2);

const fn subnetwork_from_byte(byte: u8) -> SubnetworkId {
    let mut bytes = [0u8; SUBNETWORK_ID_LEN];
    bytes[0] = byte;
    SubnetworkId(bytes)
}

impl SubnetworkId {
    pub fn is_native(&self) -> bool {
        *self == SUBNETWORK_ID_NATIVE
    }

    /// Built-in subnetworks carry protocol semantics and never carry gas.
    pub fn is_builtin(&self) -> bool {
        *self == SUBNETWORK_ID_COINBASE || *self == SUBNETWORK_ID_REGISTRY
    }

    pub fn as_bytes(&self) -> &[u8; SUBNETWORK_ID_LEN] {
        &self.0
    }
}

impl Encodable for SubnetworkId {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.0);
    }
}

impl Decodable for SubnetworkId {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self(decoder.read_fixed::<SUBNETWORK_ID_LEN>()?))
    }
}
