//! Block header and block types.

use dagd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub parent_hashes: Vec<Hash256>,
    pub hash_merkle_root: Hash256,
    pub accepted_id_merkle_root: Hash256,
    pub utxo_commitment: Hash256,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty()
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.parent_hashes.len() as u64);
        for parent in &self.parent_hashes {
            encoder.write_hash(parent);
        }
        encoder.write_hash(&self.hash_merkle_root);
        encoder.write_hash(&self.accepted_id_merkle_root);
        encoder.write_hash(&self.utxo_commitment);
        encoder.write_i64_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u64_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let parent_count = decoder.read_varint()? as usize;
        let mut parent_hashes = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parent_hashes.push(decoder.read_hash()?);
        }
        let hash_merkle_root = decoder.read_hash()?;
        let accepted_id_merkle_root = decoder.read_hash()?;
        let utxo_commitment = decoder.read_hash()?;
        let timestamp = decoder.read_i64_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u64_le()?;
        Ok(Self {
            version,
            parent_hashes,
            hash_merkle_root,
            accepted_id_merkle_root,
            utxo_commitment,
            timestamp,
            bits,
            nonce,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_varint()? as usize;
        let mut transactions = Vec::with_capacity(count);
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}
