//! UTXO entries and collections.

use std::collections::HashMap;

use dagd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use dagd_primitives::outpoint::OutPoint;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub amount: u64,
    pub script_pub_key: Vec<u8>,
    /// Blue score of the block that produced this output.
    pub block_blue_score: u64,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.amount);
        encoder.write_var_bytes(&self.script_pub_key);
        encoder.write_u64_le(self.block_blue_score);
        encoder.write_u8(u8::from(self.is_coinbase));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let entry = Self::decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(entry)
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let amount = decoder.read_u64_le()?;
        let script_pub_key = decoder.read_var_bytes()?;
        let block_blue_score = decoder.read_u64_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        Ok(Self {
            amount,
            script_pub_key,
            block_blue_score,
            is_coinbase,
        })
    }
}

/// The byte string committed to the multiset for one UTXO.
pub fn serialize_utxo(outpoint: &OutPoint, entry: &UtxoEntry) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_bytes(&outpoint.key_bytes());
    encoder.write_bytes(&entry.encode());
    encoder.into_inner()
}

/// An outpoint-keyed set of UTXO entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UtxoCollection(pub HashMap<OutPoint, UtxoEntry>);

impl UtxoCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.0.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.0.contains_key(outpoint)
    }

    /// Containment that also matches the producing block's blue score.
    /// The diff algebra treats the same outpoint at different blue
    /// scores as distinct coins.
    pub fn contains_with_blue_score(&self, outpoint: &OutPoint, blue_score: u64) -> bool {
        self.0
            .get(outpoint)
            .is_some_and(|entry| entry.block_blue_score == blue_score)
    }

    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.0.insert(outpoint, entry);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) {
        self.0.remove(outpoint);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.0.iter()
    }

    pub fn encode_to(&self, encoder: &mut Encoder) {
        let mut entries: Vec<(&OutPoint, &UtxoEntry)> = self.0.iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
        encoder.write_varint(entries.len() as u64);
        for (outpoint, entry) in entries {
            outpoint.consensus_encode(encoder);
            encoder.write_var_bytes(&entry.encode());
        }
    }

    pub fn decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let count = decoder.read_varint()? as usize;
        let mut collection = HashMap::with_capacity(count);
        for _ in 0..count {
            let outpoint = OutPoint::consensus_decode(decoder)?;
            let entry_bytes = decoder.read_var_bytes()?;
            let entry = UtxoEntry::decode(&entry_bytes)?;
            collection.insert(outpoint, entry);
        }
        Ok(Self(collection))
    }
}
