//! Queue of blocks whose timestamps are too far in the future. A
//! min-heap keyed by process time; ties drain in arrival order so a
//! delayed parent is always replayed before its delayed child.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use dagd_consensus::Hash256;
use dagd_primitives::block::Block;

struct HeapEntry {
    process_time: i64,
    sequence: u64,
    block: Block,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.process_time == other.process_time && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.process_time, self.sequence).cmp(&(other.process_time, other.sequence))
    }
}

#[derive(Default)]
pub struct DelayedBlocks {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    process_times: HashMap<Hash256, i64>,
    next_sequence: u64,
}

impl DelayedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, block: Block, process_time: i64) {
        let hash = block.hash();
        self.process_times.insert(hash, process_time);
        self.heap.push(Reverse(HeapEntry {
            process_time,
            sequence: self.next_sequence,
            block,
        }));
        self.next_sequence += 1;
    }

    pub fn is_known(&self, hash: &Hash256) -> bool {
        self.process_times.contains_key(hash)
    }

    pub fn process_time(&self, hash: &Hash256) -> Option<i64> {
        self.process_times.get(hash).copied()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pops the next block whose process time has arrived.
    pub fn next_ready(&mut self, now: i64) -> Option<Block> {
        let ready = self
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.process_time <= now);
        if !ready {
            return None;
        }
        let Reverse(entry) = self.heap.pop().expect("peeked above");
        self.process_times.remove(&entry.block.hash());
        Some(entry.block)
    }
}
