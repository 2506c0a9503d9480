//! Shared fixtures: a controllable clock, a harness owning a DAG over a
//! memory store, and a block builder that assembles valid blocks from
//! the virtual's template data.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dagd_blockdag::dag::{BlockDag, Config, ProcessResult, BF_NO_POW_CHECK};
use dagd_blockdag::error::DagError;
use dagd_blockdag::flatfiles::FlatFileStore;
use dagd_blockdag::interfaces::TimeSource;
use dagd_blockdag::params::Params;
use dagd_consensus::Hash256;
use dagd_primitives::block::{Block, BlockHeader};
use dagd_primitives::merkle::hash_merkle_root;
use dagd_primitives::outpoint::OutPoint;
use dagd_primitives::subnetwork::{SUBNETWORK_ID_COINBASE, SUBNETWORK_ID_NATIVE};
use dagd_primitives::transaction::{Transaction, TxIn, TxOut};
use dagd_consensus::ZERO_HASH;
use dagd_storage::memory::MemoryStore;

/// A clock the tests can move forward at will.
pub struct MockTimeSource {
    now_ms: AtomicI64,
}

impl MockTimeSource {
    pub fn new(start_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicI64::new(start_ms),
        })
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub struct DagHarness {
    pub dag: BlockDag<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<MockTimeSource>,
    pub params: Params,
    nonce: std::cell::Cell<u64>,
    _dir: tempfile::TempDir,
}

impl DagHarness {
    pub fn new(params: Params, clock: Arc<MockTimeSource>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_store(params, clock, store)
    }

    pub fn with_store(
        params: Params,
        clock: Arc<MockTimeSource>,
        store: Arc<MemoryStore>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let block_files = FlatFileStore::new(dir.path(), 10_000_000).expect("flat files");
        let dag = BlockDag::new(Config {
            params: params.clone(),
            store: Arc::clone(&store),
            block_files,
            time_source: clock.clone(),
            script_verifier: None,
            index_manager: None,
            local_subnetwork_id: None,
            interrupt: None,
        })
        .expect("dag init");
        Self {
            dag,
            store,
            clock,
            params,
            nonce: std::cell::Cell::new(0),
            _dir: dir,
        }
    }

    /// Assembles a valid next block over the current tips carrying the
    /// given non-coinbase transactions.
    pub fn build_block(&self, transactions: Vec<Transaction>) -> Block {
        let template = self.dag.build_block_template().expect("template");
        let coinbase = coinbase_paying(
            self.params.base_subsidy,
            template.blue_score,
            self.next_nonce(),
        );

        let mut block_transactions = vec![coinbase];
        block_transactions.extend(transactions);

        let timestamp = self
            .clock
            .now_ms()
            .max(template.median_time + 1);
        Block {
            header: BlockHeader {
                version: 1,
                parent_hashes: template.parent_hashes,
                hash_merkle_root: hash_merkle_root(&block_transactions),
                accepted_id_merkle_root: template.accepted_id_merkle_root,
                utxo_commitment: template.utxo_commitment,
                timestamp,
                bits: template.bits,
                nonce: self.next_nonce(),
            },
            transactions: block_transactions,
        }
    }

    pub fn submit(&self, block: &Block) -> Result<ProcessResult, DagError> {
        self.dag.process_block(block, BF_NO_POW_CHECK)
    }

    /// Builds, submits, and returns the next block, advancing the clock
    /// one block interval.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Block {
        self.clock.advance(self.params.target_time_per_block);
        let block = self.build_block(transactions);
        let result = self.submit(&block).expect("submit block");
        assert!(result.was_accepted(), "mined block was not accepted");
        block
    }

    /// Mines `count` empty blocks and returns them.
    pub fn mine_chain(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine_block(Vec::new())).collect()
    }

    fn next_nonce(&self) -> u64 {
        let nonce = self.nonce.get() + 1;
        self.nonce.set(nonce);
        nonce
    }
}

pub fn coinbase_paying(value: u64, blue_score: u64, tag: u64) -> Transaction {
    let mut payload = blue_score.to_le_bytes().to_vec();
    payload.extend_from_slice(&tag.to_le_bytes());
    let tx = Transaction {
        version: 1,
        inputs: Vec::new(),
        outputs: vec![TxOut {
            value,
            script_pub_key: anyone_can_spend_script(),
        }],
        lock_time: 0,
        subnetwork_id: SUBNETWORK_ID_COINBASE,
        gas: 0,
        payload_hash: ZERO_HASH,
        payload,
    };
    Transaction {
        payload_hash: tx.computed_payload_hash(),
        ..tx
    }
}

pub fn spend_tx(previous: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_outpoint: previous,
            signature_script: Vec::new(),
            sequence: u64::MAX,
        }],
        outputs: vec![TxOut {
            value,
            script_pub_key: anyone_can_spend_script(),
        }],
        lock_time: 0,
        subnetwork_id: SUBNETWORK_ID_NATIVE,
        gas: 0,
        payload_hash: ZERO_HASH,
        payload: Vec::new(),
    }
}

pub fn anyone_can_spend_script() -> Vec<u8> {
    vec![0x51]
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].id(), 0)
}

pub fn hashes_of(blocks: &[Block]) -> Vec<Hash256> {
    blocks.iter().map(|block| block.hash()).collect()
}
