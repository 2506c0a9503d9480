use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-memory backend used by tests and tooling: one ordered map per
/// column, each behind its own lock, so readers of one column never
/// contend with writers of another. A batch takes the write locks of
/// every column it touches before applying anything, so a committed
/// batch becomes visible as a whole.
pub struct MemoryStore {
    columns: [RwLock<ColumnMap>; Column::ALL.len()],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            columns: std::array::from_fn(|_| RwLock::new(BTreeMap::new())),
        }
    }

    fn column(&self, column: Column) -> &RwLock<ColumnMap> {
        &self.columns[column.index()]
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.column(column).read().expect("memory column lock");
        Ok(map.get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.column(column).write().expect("memory column lock");
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.column(column).write().expect("memory column lock");
        map.remove(key);
        Ok(())
    }

    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        let map = self.column(column).read().expect("memory column lock");
        Ok(map.contains_key(key))
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let map = self.column(column).read().expect("memory column lock");
        let results = map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let map = self.column(column).read().expect("memory column lock");
        for (key, value) in map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        // Lock the touched columns up front, in declaration order so two
        // concurrent batches can never deadlock against each other.
        let mut guards: [Option<RwLockWriteGuard<'_, ColumnMap>>; Column::ALL.len()] =
            std::array::from_fn(|_| None);
        for column in Column::ALL {
            if batch.touches(column) {
                guards[column.index()] =
                    Some(self.column(column).write().expect("memory column lock"));
            }
        }

        for op in batch.iter() {
            let map = guards[op.column().index()]
                .as_mut()
                .expect("touched column locked above");
            match op {
                WriteOp::Put { key, value, .. } => {
                    map.insert(key.as_slice().to_vec(), value.as_slice().to_vec());
                }
                WriteOp::Delete { key, .. } => {
                    map.remove(key.as_slice());
                }
            }
        }
        Ok(())
    }
}
