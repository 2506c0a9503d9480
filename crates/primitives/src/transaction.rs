//! Transaction types and serialization.

use dagd_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::subnetwork::{SubnetworkId, SUBNETWORK_ID_COINBASE};

/// Sequence bit disabling relative lock-time semantics for an input.
pub const SEQUENCE_LOCK_TIME_DISABLED: u64 = 1 << 63;
/// Sequence bit flagging a time-based (milliseconds) relative lock.
pub const SEQUENCE_LOCK_TIME_IS_MILLISECONDS: u64 = 1 << 62;
/// Mask extracting the relative lock value from a sequence number.
pub const SEQUENCE_LOCK_TIME_MASK: u64 = 0xffff_ffff;
/// Time-based locks are expressed in 2^19-millisecond granules.
pub const SEQUENCE_LOCK_TIME_GRANULARITY: u64 = 19;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u64,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.previous_outpoint.consensus_encode(encoder);
        encoder.write_var_bytes(&self.signature_script);
        encoder.write_u64_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let previous_outpoint = OutPoint::consensus_decode(decoder)?;
        let signature_script = decoder.read_var_bytes()?;
        let sequence = decoder.read_u64_le()?;
        Ok(Self {
            previous_outpoint,
            signature_script,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pub_key: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.value);
        encoder.write_var_bytes(&self.script_pub_key);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_u64_le()?;
        let script_pub_key = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pub_key,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u64,
    pub subnetwork_id: SubnetworkId,
    pub gas: u64,
    pub payload_hash: Hash256,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.subnetwork_id == SUBNETWORK_ID_COINBASE
    }

    /// Hash over the full serialization; leaf value of the block merkle root.
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    /// Transaction ID: the hash with signature scripts and payload
    /// cleared, so it is stable across malleation of either. Coinbase
    /// payloads are part of the ID — they are the only thing that
    /// distinguishes two coinbases paying the same outputs.
    pub fn id(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.encode_for_id(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    /// The expected value of `payload_hash` for this transaction's payload.
    pub fn computed_payload_hash(&self) -> Hash256 {
        if self.payload.is_empty() {
            ZERO_HASH
        } else {
            sha256d(&self.payload)
        }
    }

    fn encode_for_id(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous_outpoint.consensus_encode(encoder);
            encoder.write_varint(0);
            encoder.write_u64_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_u64_le(self.lock_time);
        self.subnetwork_id.consensus_encode(encoder);
        encoder.write_u64_le(self.gas);
        encoder.write_hash(&self.payload_hash);
        if self.is_coinbase() {
            encoder.write_var_bytes(&self.payload);
        } else {
            encoder.write_varint(0);
        }
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous_outpoint.consensus_encode(encoder);
            encoder.write_var_bytes(&input.signature_script);
            encoder.write_u64_le(input.sequence);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_u64_le(self.lock_time);
        self.subnetwork_id.consensus_encode(encoder);
        encoder.write_u64_le(self.gas);
        encoder.write_hash(&self.payload_hash);
        encoder.write_var_bytes(&self.payload);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let input_count = decoder.read_varint()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u64_le()?;
        let subnetwork_id = SubnetworkId::consensus_decode(decoder)?;
        let gas = decoder.read_u64_le()?;
        let payload_hash = decoder.read_hash()?;
        let payload = decoder.read_var_bytes()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
            subnetwork_id,
            gas,
            payload_hash,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::subnetwork::SUBNETWORK_ID_NATIVE;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_outpoint: OutPoint::new([7u8; 32], 3),
                signature_script: vec![0x51, 0x52],
                sequence: u64::MAX,
            }],
            outputs: vec![TxOut {
                value: 5_000,
                script_pub_key: vec![0xaa; 25],
            }],
            lock_time: 0,
            subnetwork_id: SUBNETWORK_ID_NATIVE,
            gas: 0,
            payload_hash: ZERO_HASH,
            payload: Vec::new(),
        }
    }

    #[test]
    fn round_trip() {
        let tx = sample_tx();
        let bytes = encode(&tx);
        let decoded: Transaction = decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn id_ignores_signature_script() {
        let tx = sample_tx();
        let mut malleated = tx.clone();
        malleated.inputs[0].signature_script = vec![0x00; 8];
        assert_eq!(tx.id(), malleated.id());
        assert_ne!(tx.hash(), malleated.hash());
    }

    #[test]
    fn coinbase_detection_is_by_subnetwork() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.subnetwork_id = SUBNETWORK_ID_COINBASE;
        tx.inputs.clear();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn coinbase_id_depends_on_payload() {
        let mut coinbase = sample_tx();
        coinbase.subnetwork_id = SUBNETWORK_ID_COINBASE;
        coinbase.inputs.clear();
        coinbase.payload = 1u64.to_le_bytes().to_vec();
        coinbase.payload_hash = coinbase.computed_payload_hash();

        let mut sibling = coinbase.clone();
        sibling.payload = 2u64.to_le_bytes().to_vec();
        sibling.payload_hash = sibling.computed_payload_hash();

        assert_ne!(coinbase.id(), sibling.id());
    }
}
