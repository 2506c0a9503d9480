//! Coinbase rules and per-block fee data.

use dagd_primitives::block::Block;
use dagd_storage::{Column, KeyValueStore, WriteBatch};

use dagd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::acceptance::MultiBlockTxsAcceptanceData;
use crate::error::{DagError, RuleError};
use crate::params::Params;

/// The fee of every transaction in a block, in block order. Coinbase
/// entries are zero.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactFeeData(pub Vec<u64>);

impl CompactFeeData {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.0.len() as u64);
        for &fee in &self.0 {
            encoder.write_u64_le(fee);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()? as usize;
        let mut fees = Vec::with_capacity(count);
        for _ in 0..count {
            fees.push(decoder.read_u64_le()?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self(fees))
    }

    pub fn fee(&self, index: usize) -> Option<u64> {
        self.0.get(index).copied()
    }
}

pub fn put_fee_data(batch: &mut WriteBatch, block_hash: &dagd_consensus::Hash256, fees: &CompactFeeData) {
    batch.put(Column::FeeData, *block_hash, fees.encode());
}

pub fn fetch_fee_data<S: KeyValueStore>(
    store: &S,
    block_hash: &dagd_consensus::Hash256,
) -> Result<CompactFeeData, DagError> {
    let bytes = store
        .get(Column::FeeData, block_hash)?
        .ok_or_else(|| DagError::corruption("missing fee data"))?;
    CompactFeeData::decode(&bytes).map_err(|err| DagError::corruption(err.to_string()))
}

/// A block's coinbase must commit to the block's blue score in its
/// payload (so coinbases at different DAG positions never collide), and
/// may claim at most the subsidy plus the fees of the transactions its
/// acceptance data marks accepted.
pub fn validate_coinbase_transaction<S: KeyValueStore>(
    store: &S,
    block: &Block,
    acceptance_data: &MultiBlockTxsAcceptanceData,
    params: &Params,
    blue_score: u64,
) -> Result<(), DagError> {
    let Some(coinbase) = block.coinbase() else {
        return Err(RuleError::InvalidBlock("block has no coinbase transaction").into());
    };

    let committed_blue_score = coinbase
        .payload
        .get(..8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes);
    if committed_blue_score != Some(blue_score) {
        return Err(RuleError::BadCoinbasePayload.into());
    }

    let mut allowed = params.base_subsidy;
    for block_acceptance in acceptance_data {
        let mut fees: Option<CompactFeeData> = None;
        for (index, tx_acceptance) in block_acceptance.tx_acceptance_data.iter().enumerate() {
            if !tx_acceptance.is_accepted {
                continue;
            }
            let fee_data = match &fees {
                Some(data) => data,
                None => {
                    fees = Some(fetch_fee_data(store, &block_acceptance.block_hash)?);
                    fees.as_ref().expect("just set")
                }
            };
            let fee = fee_data
                .fee(index)
                .ok_or_else(|| DagError::corruption("fee data shorter than block"))?;
            allowed = allowed.saturating_add(fee);
        }
    }

    let paid: u64 = coinbase
        .outputs
        .iter()
        .fold(0u64, |sum, output| sum.saturating_add(output.value));
    if paid > allowed {
        return Err(RuleError::BadCoinbaseValue.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptance::{BlockTxsAcceptanceData, TxAcceptanceData};
    use dagd_consensus::ZERO_HASH;
    use dagd_primitives::block::BlockHeader;
    use dagd_primitives::subnetwork::SUBNETWORK_ID_COINBASE;
    use dagd_primitives::transaction::{Transaction, TxOut};
    use dagd_storage::memory::MemoryStore;

    fn block_with_coinbase_paying(value: u64) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: vec![TxOut {
                value,
                script_pub_key: vec![0x51],
            }],
            lock_time: 0,
            subnetwork_id: SUBNETWORK_ID_COINBASE,
            gas: 0,
            payload_hash: ZERO_HASH,
            payload: 5u64.to_le_bytes().to_vec(),
        };
        Block {
            header: BlockHeader {
                version: 1,
                parent_hashes: vec![[1u8; 32]],
                hash_merkle_root: ZERO_HASH,
                accepted_id_merkle_root: ZERO_HASH,
                utxo_commitment: ZERO_HASH,
                timestamp: 0,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![coinbase],
        }
    }

    #[test]
    fn fee_data_round_trip() {
        let fees = CompactFeeData(vec![0, 150, 2_000]);
        let decoded = CompactFeeData::decode(&fees.encode()).expect("decode");
        assert_eq!(decoded, fees);
        assert_eq!(decoded.fee(1), Some(150));
        assert_eq!(decoded.fee(3), None);
    }

    #[test]
    fn coinbase_may_claim_subsidy_plus_accepted_fees() {
        let params = Params::regtest();
        let store = MemoryStore::new();
        let blue_hash = [7u8; 32];
        let mut batch = dagd_storage::WriteBatch::new();
        put_fee_data(&mut batch, &blue_hash, &CompactFeeData(vec![0, 100, 30]));
        store.write_batch(&batch).expect("commit");

        let acceptance = vec![BlockTxsAcceptanceData {
            block_hash: blue_hash,
            tx_acceptance_data: vec![
                TxAcceptanceData {
                    tx_id: [0u8; 32],
                    is_accepted: true,
                },
                TxAcceptanceData {
                    tx_id: [1u8; 32],
                    is_accepted: true,
                },
                TxAcceptanceData {
                    tx_id: [2u8; 32],
                    is_accepted: false,
                },
            ],
        }];

        let ok = block_with_coinbase_paying(params.base_subsidy + 100);
        validate_coinbase_transaction(&store, &ok, &acceptance, &params, 5).expect("valid");

        let greedy = block_with_coinbase_paying(params.base_subsidy + 131);
        let err = validate_coinbase_transaction(&store, &greedy, &acceptance, &params, 5)
            .expect_err("greedy coinbase");
        assert!(matches!(err, DagError::Rule(RuleError::BadCoinbaseValue)));
    }

    #[test]
    fn coinbase_must_commit_to_the_blue_score() {
        let params = Params::regtest();
        let store = MemoryStore::new();
        let block = block_with_coinbase_paying(params.base_subsidy);
        let err = validate_coinbase_transaction(&store, &block, &Vec::new(), &params, 6)
            .expect_err("wrong blue score");
        assert!(matches!(err, DagError::Rule(RuleError::BadCoinbasePayload)));
    }
}
