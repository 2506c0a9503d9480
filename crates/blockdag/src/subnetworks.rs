//! Subnetwork registry and gas-limit enforcement.

use dagd_primitives::subnetwork::{SubnetworkId, SUBNETWORK_ID_LEN, SUBNETWORK_ID_REGISTRY};
use dagd_primitives::transaction::Transaction;
use dagd_storage::{Column, KeyValueStore, WriteBatch};

use crate::error::{DagError, RuleError};

/// Gas limit of a registered subnetwork, or `None` when unknown.
pub fn gas_limit<S: KeyValueStore>(
    store: &S,
    subnetwork_id: &SubnetworkId,
) -> Result<Option<u64>, DagError> {
    let Some(bytes) = store.get(Column::Subnetworks, subnetwork_id.as_bytes())? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DagError::corruption("malformed subnetwork registry entry"))?;
    Ok(Some(u64::from_le_bytes(bytes)))
}

/// The subnetwork a registry transaction creates: derived from the
/// transaction ID so it is unique and unforgeable.
pub fn subnetwork_id_from_registry_tx(tx: &Transaction) -> SubnetworkId {
    let tx_id = tx.id();
    let mut bytes = [0u8; SUBNETWORK_ID_LEN];
    bytes.copy_from_slice(&tx_id[..SUBNETWORK_ID_LEN]);
    SubnetworkId(bytes)
}

/// Scans a connected block's transactions and records any subnetwork
/// registrations. A malformed registry transaction fails the block.
pub fn register_subnetworks(
    batch: &mut WriteBatch,
    transactions: &[Transaction],
) -> Result<(), DagError> {
    for tx in transactions {
        if tx.subnetwork_id != SUBNETWORK_ID_REGISTRY {
            continue;
        }
        if tx.payload.len() != 8 {
            return Err(
                RuleError::InvalidTransaction("malformed subnetwork registry payload").into(),
            );
        }
        let gas_limit = u64::from_le_bytes(tx.payload[..8].try_into().expect("checked length"));
        let new_id = subnetwork_id_from_registry_tx(tx);
        batch.put(
            Column::Subnetworks,
            *new_id.as_bytes(),
            gas_limit.to_le_bytes(),
        );
    }
    Ok(())
}

/// Enforces per-subnetwork gas limits over a block's transactions.
/// Transactions are already known to be grouped by subnetwork.
pub fn validate_gas_limit<S: KeyValueStore>(
    store: &S,
    transactions: &[Transaction],
) -> Result<(), DagError> {
    let mut current_subnetwork: Option<SubnetworkId> = None;
    let mut current_limit = 0u64;
    let mut current_usage = 0u64;

    for tx in transactions {
        if tx.subnetwork_id.is_native() || tx.subnetwork_id.is_builtin() {
            // Native and builtin transactions carry zero gas, which
            // block sanity already guarantees.
            continue;
        }

        if current_subnetwork != Some(tx.subnetwork_id) {
            current_subnetwork = Some(tx.subnetwork_id);
            current_usage = 0;
            current_limit = gas_limit(store, &tx.subnetwork_id)?
                .ok_or(RuleError::InvalidGas("transaction references an unregistered subnetwork"))?;
        }

        let new_usage = current_usage
            .checked_add(tx.gas)
            .ok_or(RuleError::InvalidGas("subnetwork gas usage overflows"))?;
        if new_usage > current_limit {
            return Err(RuleError::InvalidGas("block exceeds subnetwork gas limit").into());
        }
        current_usage = new_usage;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagd_consensus::ZERO_HASH;
    use dagd_primitives::subnetwork::SUBNETWORK_ID_NATIVE;
    use dagd_storage::memory::MemoryStore;

    fn registry_tx(gas_limit: u64) -> Transaction {
        let tx = Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            subnetwork_id: SUBNETWORK_ID_REGISTRY,
            gas: 0,
            payload_hash: ZERO_HASH,
            payload: gas_limit.to_le_bytes().to_vec(),
        };
        Transaction {
            payload_hash: tx.computed_payload_hash(),
            ..tx
        }
    }

    fn gas_tx(subnetwork_id: SubnetworkId, gas: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
            subnetwork_id,
            gas,
            payload_hash: ZERO_HASH,
            payload: Vec::new(),
        }
    }

    #[test]
    fn registration_and_lookup() {
        let store = MemoryStore::new();
        let tx = registry_tx(10_000);
        let mut batch = WriteBatch::new();
        register_subnetworks(&mut batch, std::slice::from_ref(&tx)).expect("register");
        store.write_batch(&batch).expect("commit");

        let id = subnetwork_id_from_registry_tx(&tx);
        assert_eq!(gas_limit(&store, &id).expect("lookup"), Some(10_000));
        assert_eq!(
            gas_limit(&store, &SubnetworkId([9u8; SUBNETWORK_ID_LEN])).expect("lookup"),
            None
        );
    }

    #[test]
    fn malformed_registration_fails() {
        let mut tx = registry_tx(1);
        tx.payload.pop();
        let mut batch = WriteBatch::new();
        let err = register_subnetworks(&mut batch, std::slice::from_ref(&tx)).expect_err("short");
        assert!(err.is_rule_error());
    }

    #[test]
    fn gas_limit_is_enforced_per_subnetwork() {
        let store = MemoryStore::new();
        let registration = registry_tx(100);
        let mut batch = WriteBatch::new();
        register_subnetworks(&mut batch, std::slice::from_ref(&registration)).expect("register");
        store.write_batch(&batch).expect("commit");

        let id = subnetwork_id_from_registry_tx(&registration);
        let txs = vec![
            gas_tx(SUBNETWORK_ID_NATIVE, 0),
            gas_tx(id, 60),
            gas_tx(id, 40),
        ];
        validate_gas_limit(&store, &txs).expect("within limit");

        let over = vec![gas_tx(id, 60), gas_tx(id, 41)];
        let err = validate_gas_limit(&store, &over).expect_err("over limit");
        assert!(err.is_rule_error());

        let unknown = vec![gas_tx(SubnetworkId([3u8; SUBNETWORK_ID_LEN]), 1)];
        assert!(validate_gas_limit(&store, &unknown).is_err());
    }
}
