//! Transaction acceptance data.
//!
//! When a block's past-UTXO is built, every transaction of every blue
//! block is either applied (accepted) or skipped; the outcome is
//! recorded here, ordered the way the blues are ordered so consumers
//! process blocks in their order of appearance in the DAG.

use dagd_consensus::Hash256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxAcceptanceData {
    pub tx_id: Hash256,
    pub is_accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTxsAcceptanceData {
    pub block_hash: Hash256,
    /// One entry per transaction, in block order.
    pub tx_acceptance_data: Vec<TxAcceptanceData>,
}

pub type MultiBlockTxsAcceptanceData = Vec<BlockTxsAcceptanceData>;

/// The IDs of all accepted transactions across the blue blocks.
pub fn accepted_tx_ids(acceptance_data: &MultiBlockTxsAcceptanceData) -> Vec<Hash256> {
    let mut ids = Vec::new();
    for block_acceptance in acceptance_data {
        for tx_acceptance in &block_acceptance.tx_acceptance_data {
            if tx_acceptance.is_accepted {
                ids.push(tx_acceptance.tx_id);
            }
        }
    }
    ids
}
