use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The buckets used by the consensus core. `BlockIndex` keys are
/// `<blue score BE u64><block hash>` so a plain key scan yields blocks in
/// blue-score order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    BlockIndex,
    BlockLocations,
    UtxoDiffs,
    Multisets,
    ReachabilityData,
    UtxoSet,
    FeeData,
    Subnetworks,
    DagState,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::BlockIndex,
        Column::BlockLocations,
        Column::UtxoDiffs,
        Column::Multisets,
        Column::ReachabilityData,
        Column::UtxoSet,
        Column::FeeData,
        Column::Subnetworks,
        Column::DagState,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Column::BlockIndex => 1 << 0,
            Column::BlockLocations => 1 << 1,
            Column::UtxoDiffs => 1 << 2,
            Column::Multisets => 1 << 3,
            Column::ReachabilityData => 1 << 4,
            Column::UtxoSet => 1 << 5,
            Column::FeeData => 1 << 6,
            Column::Subnetworks => 1 << 7,
            Column::DagState => 1 << 8,
        }
    }

    pub const fn index(self) -> usize {
        self.bit().trailing_zeros() as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::BlockLocations => "block_locations",
            Column::UtxoDiffs => "utxo_diffs",
            Column::Multisets => "multisets",
            Column::ReachabilityData => "reachability_data",
            Column::UtxoSet => "utxo_set",
            Column::FeeData => "fee_data",
            Column::Subnetworks => "subnetworks",
            Column::DagState => "dag_state",
        }
    }
}

/// Byte buffer for batched keys and values. The inline capacity is sized
/// to the widest fixed-size key the core writes — the 40-byte
/// blue-score-prefixed block-index key — so flushing index rows never
/// allocates per key. Hashes (32), outpoint keys (36), and locations
/// (16) all fit inline as well; larger values spill to the heap.
#[derive(Clone, Debug)]
pub struct StoreBuf(SmallVec<[u8; 40]>);

impl StoreBuf {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0.into_vec()
    }
}

impl AsRef<[u8]> for StoreBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for StoreBuf {
    fn from(value: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(value))
    }
}

impl From<&[u8]> for StoreBuf {
    fn from(value: &[u8]) -> Self {
        Self::from_slice(value)
    }
}

impl<const N: usize> From<[u8; N]> for StoreBuf {
    fn from(value: [u8; N]) -> Self {
        Self::from_slice(&value)
    }
}

impl<const N: usize> From<&[u8; N]> for StoreBuf {
    fn from(value: &[u8; N]) -> Self {
        Self::from_slice(value)
    }
}

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: StoreBuf,
        value: StoreBuf,
    },
    Delete {
        column: Column,
        key: StoreBuf,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key.as_slice(),
        }
    }
}

/// A batch of writes committed atomically by `KeyValueStore::write_batch`.
/// Building a batch and dropping it uncommitted is the rollback path.
/// The batch tracks which columns it touches, so backends can lock or
/// group work per column without rescanning the ops.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
    touched: u32,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            touched: 0,
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<StoreBuf>, value: impl Into<StoreBuf>) {
        self.touched |= column.bit();
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<StoreBuf>) {
        self.touched |= column.bit();
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Bitmask (by `Column::bit`) of every column this batch writes.
    pub fn touched_columns(&self) -> u32 {
        self.touched
    }

    pub fn touches(&self, column: Column) -> bool {
        self.touched & column.bit() != 0
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;
    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(column, key)?.is_some())
    }
    /// Visits entries in ascending key order.
    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

macro_rules! impl_forwarding_store {
    ($($wrapper:ty),+ $(,)?) => {$(
        impl<T: KeyValueStore + ?Sized> KeyValueStore for $wrapper {
            fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
                (**self).get(column, key)
            }

            fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
                (**self).put(column, key, value)
            }

            fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
                (**self).delete(column, key)
            }

            fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
                (**self).has(column, key)
            }

            fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
                (**self).scan_prefix(column, prefix)
            }

            fn for_each_prefix<'a>(
                &self,
                column: Column,
                prefix: &[u8],
                visitor: &mut PrefixVisitor<'a>,
            ) -> Result<(), StoreError> {
                (**self).for_each_prefix(column, prefix, visitor)
            }

            fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
                (**self).write_batch(batch)
            }
        }
    )+};
}

impl_forwarding_store!(Arc<T>, Box<T>, &T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_buf_keeps_index_keys_inline() {
        let key = StoreBuf::from([0x11u8; 40]);
        assert_eq!(key.len(), 40);
        assert_eq!(key.as_slice(), &[0x11u8; 40][..]);
        assert_eq!(StoreBuf::from(vec![1, 2, 3]).into_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn batch_tracks_touched_columns() {
        let mut batch = WriteBatch::with_capacity(3);
        assert_eq!(batch.touched_columns(), 0);
        batch.put(Column::BlockIndex, *b"key", *b"value");
        batch.delete(Column::UtxoSet, *b"gone");
        assert!(batch.touches(Column::BlockIndex));
        assert!(batch.touches(Column::UtxoSet));
        assert!(!batch.touches(Column::DagState));
        assert_eq!(
            batch.touched_columns(),
            Column::BlockIndex.bit() | Column::UtxoSet.bit()
        );
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn write_op_accessors() {
        let mut batch = WriteBatch::new();
        batch.put(Column::FeeData, *b"a", *b"1");
        batch.delete(Column::FeeData, *b"b");
        let ops = batch.into_ops();
        assert_eq!(ops[0].column(), Column::FeeData);
        assert_eq!(ops[0].key(), b"a");
        assert_eq!(ops[1].key(), b"b");
    }
}
