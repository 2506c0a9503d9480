//! DAG parameter definitions.

use dagd_consensus::money::SOMPI_PER_COIN;
use dagd_consensus::{Hash256, KType, ZERO_HASH};
use dagd_primitives::block::{Block, BlockHeader};
use dagd_primitives::merkle::hash_merkle_root;
use dagd_primitives::subnetwork::SUBNETWORK_ID_COINBASE;
use dagd_primitives::transaction::Transaction;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct Params {
    pub network: Network,
    /// The anticone-size bound of the GHOSTDAG k-cluster rule.
    pub k: KType,
    /// Target time between blocks, in milliseconds.
    pub target_time_per_block: i64,
    /// Wall-clock span a block must survive before it is finalized, in
    /// milliseconds.
    pub finality_duration: i64,
    /// Tolerated timestamp skew, measured in blocks.
    pub timestamp_deviation_tolerance: u64,
    /// Number of blue blocks averaged when retargeting difficulty.
    pub difficulty_adjustment_window_size: usize,
    /// Blue-score depth before a coinbase output may be spent.
    pub coinbase_maturity: u64,
    pub max_block_parents: usize,
    pub pow_limit_bits: u32,
    pub base_subsidy: u64,
    pub genesis: Block,
}

impl Params {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            k: 18,
            target_time_per_block: 1_000,
            finality_duration: 86_400_000,
            timestamp_deviation_tolerance: 132,
            difficulty_adjustment_window_size: 2_640,
            coinbase_maturity: 100,
            max_block_parents: 10,
            pow_limit_bits: 0x1e7f_ffff,
            base_subsidy: 50 * SOMPI_PER_COIN,
            genesis: genesis_block(0x1e7f_ffff, 1_593_528_100_000, 0x162ca, b"mainnet"),
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            k: 10,
            target_time_per_block: 1_000,
            finality_duration: 86_400_000,
            timestamp_deviation_tolerance: 132,
            difficulty_adjustment_window_size: 2_640,
            coinbase_maturity: 100,
            max_block_parents: 10,
            pow_limit_bits: 0x207f_ffff,
            base_subsidy: 50 * SOMPI_PER_COIN,
            genesis: genesis_block(0x207f_ffff, 1_593_528_200_000, 0x41, b"testnet"),
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            k: 4,
            target_time_per_block: 1_000,
            finality_duration: 100_000,
            timestamp_deviation_tolerance: 10,
            difficulty_adjustment_window_size: 10,
            coinbase_maturity: 10,
            max_block_parents: 10,
            pow_limit_bits: 0x207f_ffff,
            base_subsidy: 50 * SOMPI_PER_COIN,
            genesis: genesis_block(0x207f_ffff, 1_593_528_300_000, 0x0, b"regtest"),
        }
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis.hash()
    }

    /// Number of blocks in one finality window.
    pub fn finality_interval(&self) -> u64 {
        (self.finality_duration / self.target_time_per_block) as u64
    }

    pub fn past_median_time_window_size(&self) -> u64 {
        2 * self.timestamp_deviation_tolerance - 1
    }

    /// How far into the future a block timestamp may run before the
    /// block is queued as delayed, in milliseconds.
    pub fn max_allowed_timestamp_offset(&self) -> i64 {
        self.timestamp_deviation_tolerance as i64 * self.target_time_per_block
    }
}

fn genesis_block(bits: u32, timestamp: i64, nonce: u64, tag: &[u8]) -> Block {
    // Coinbase payloads commit to the paying block's blue score; zero
    // for genesis.
    let mut payload = 0u64.to_le_bytes().to_vec();
    payload.extend_from_slice(tag);
    let coinbase = Transaction {
        version: 1,
        inputs: Vec::new(),
        outputs: Vec::new(),
        lock_time: 0,
        subnetwork_id: SUBNETWORK_ID_COINBASE,
        gas: 0,
        payload_hash: ZERO_HASH,
        payload,
    };
    let coinbase = Transaction {
        payload_hash: coinbase.computed_payload_hash(),
        ..coinbase
    };
    let transactions = vec![coinbase];
    let header = BlockHeader {
        version: 1,
        parent_hashes: Vec::new(),
        hash_merkle_root: hash_merkle_root(&transactions),
        accepted_id_merkle_root: ZERO_HASH,
        // Genesis has an empty past, and the commitment of the empty
        // multiset is the zero hash.
        utxo_commitment: ZERO_HASH,
        timestamp,
        bits,
        nonce,
    };
    Block {
        header,
        transactions,
    }
}
