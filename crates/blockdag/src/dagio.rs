//! Durable DAG state and block-body persistence helpers.

use serde_json::{json, Value};

use dagd_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use dagd_primitives::block::Block;
use dagd_primitives::encoding::{decode, encode};
use dagd_primitives::subnetwork::{SubnetworkId, SUBNETWORK_ID_LEN};
use dagd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::DagError;
use crate::flatfiles::{FileLocation, FlatFileStore};

const DAG_STATE_KEY: &[u8] = b"dag_state";

/// The JSON blob describing the DAG head: current tips, the finality
/// point, and which subnetwork this node tracks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DagState {
    pub tip_hashes: Vec<Hash256>,
    pub last_finality_point: Hash256,
    pub local_subnetwork_id: Option<SubnetworkId>,
}

pub fn save_dag_state(batch: &mut WriteBatch, state: &DagState) {
    let tips: Vec<String> = state.tip_hashes.iter().map(hash256_to_hex).collect();
    let value = json!({
        "tipHashes": tips,
        "lastFinalityPoint": hash256_to_hex(&state.last_finality_point),
        "localSubnetworkID": state
            .local_subnetwork_id
            .as_ref()
            .map(|id| hex_bytes(id.as_bytes())),
    });
    batch.put(Column::DagState, DAG_STATE_KEY, value.to_string().into_bytes());
}

pub fn load_dag_state<S: KeyValueStore>(store: &S) -> Result<Option<DagState>, DagError> {
    let Some(bytes) = store.get(Column::DagState, DAG_STATE_KEY)? else {
        return Ok(None);
    };
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|err| DagError::corruption(format!("invalid dag state: {err}")))?;

    let tips = value["tipHashes"]
        .as_array()
        .ok_or_else(|| DagError::corruption("dag state is missing tipHashes"))?;
    let mut tip_hashes = Vec::with_capacity(tips.len());
    for tip in tips {
        let hex = tip
            .as_str()
            .ok_or_else(|| DagError::corruption("dag state tip is not a string"))?;
        tip_hashes.push(
            hash256_from_hex(hex).map_err(|err| DagError::corruption(err.to_string()))?,
        );
    }

    let finality_hex = value["lastFinalityPoint"]
        .as_str()
        .ok_or_else(|| DagError::corruption("dag state is missing lastFinalityPoint"))?;
    let last_finality_point =
        hash256_from_hex(finality_hex).map_err(|err| DagError::corruption(err.to_string()))?;

    let local_subnetwork_id = match value.get("localSubnetworkID") {
        None | Some(Value::Null) => None,
        Some(Value::String(hex)) => Some(subnetwork_from_hex(hex)?),
        Some(_) => {
            return Err(DagError::corruption(
                "dag state localSubnetworkID is not a string",
            ))
        }
    };

    Ok(Some(DagState {
        tip_hashes,
        last_finality_point,
        local_subnetwork_id,
    }))
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn subnetwork_from_hex(hex: &str) -> Result<SubnetworkId, DagError> {
    if hex.len() != SUBNETWORK_ID_LEN * 2 {
        return Err(DagError::corruption("invalid subnetwork ID length"));
    }
    let mut bytes = [0u8; SUBNETWORK_ID_LEN];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| DagError::corruption("invalid subnetwork ID hex"))?;
    }
    Ok(SubnetworkId(bytes))
}

/// Appends the block body to the flat-file store and records its
/// location in the batch.
pub fn store_block(
    block_files: &FlatFileStore,
    batch: &mut WriteBatch,
    block: &Block,
) -> Result<FileLocation, DagError> {
    let bytes = encode(block);
    let location = block_files
        .append(&bytes)
        .map_err(|err| DagError::corruption(err.to_string()))?;
    batch.put(Column::BlockLocations, block.hash(), location.encode());
    Ok(location)
}

pub fn has_block<S: KeyValueStore>(store: &S, hash: &Hash256) -> Result<bool, DagError> {
    Ok(store.has(Column::BlockLocations, hash)?)
}

/// Fetches and decodes a block body. Absence of a body for a known
/// block, or an undecodable body, is store corruption.
pub fn fetch_block<S: KeyValueStore>(
    store: &S,
    block_files: &FlatFileStore,
    hash: &Hash256,
) -> Result<Block, DagError> {
    let location_bytes = store
        .get(Column::BlockLocations, hash)?
        .ok_or_else(|| DagError::corruption("missing block body location"))?;
    let location = FileLocation::decode(&location_bytes)
        .ok_or_else(|| DagError::corruption("invalid block body location"))?;
    let bytes = block_files
        .read(location)
        .map_err(|err| DagError::corruption(err.to_string()))?;
    decode::<Block>(&bytes).map_err(|err| DagError::corruption(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagd_primitives::subnetwork::SUBNETWORK_ID_NATIVE;
    use dagd_storage::memory::MemoryStore;

    #[test]
    fn dag_state_round_trips() {
        let store = MemoryStore::new();
        let state = DagState {
            tip_hashes: vec![[1u8; 32], [2u8; 32]],
            last_finality_point: [3u8; 32],
            local_subnetwork_id: Some(SUBNETWORK_ID_NATIVE),
        };
        let mut batch = WriteBatch::new();
        save_dag_state(&mut batch, &state);
        store.write_batch(&batch).expect("commit");

        let loaded = load_dag_state(&store).expect("load").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_dag_state_is_none() {
        let store = MemoryStore::new();
        assert!(load_dag_state(&store).expect("load").is_none());
    }

    #[test]
    fn block_bodies_round_trip_through_the_flat_files() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().expect("tempdir");
        let block_files = FlatFileStore::new(dir.path(), 1_000_000).expect("flat files");

        let block = crate::params::Params::regtest().genesis;
        let hash = block.hash();
        assert!(!has_block(&store, &hash).expect("has"));

        let mut batch = WriteBatch::new();
        store_block(&block_files, &mut batch, &block).expect("store");
        store.write_batch(&batch).expect("commit");

        assert!(has_block(&store, &hash).expect("has"));
        let fetched = fetch_block(&store, &block_files, &hash).expect("fetch");
        assert_eq!(fetched, block);
    }
}
