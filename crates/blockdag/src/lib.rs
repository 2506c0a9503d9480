//! Consensus core of the dagd node: GHOSTDAG ordering over a block DAG,
//! a reachability index, an incremental UTXO-diff engine with an ECMH
//! commitment, a virtual block over the tips, and the block-acceptance
//! orchestrator.

pub mod acceptance;
pub mod blocknode;
pub mod blockwindow;
pub mod coinbase;
pub mod dag;
pub mod dagio;
pub mod delayed;
pub mod difficulty;
pub mod error;
pub mod flatfiles;
pub mod ghostdag;
pub mod interfaces;
pub mod multiset;
pub mod notifications;
pub mod orphans;
pub mod params;
pub mod reachability;
pub mod subnetworks;
pub mod utxo;
pub mod utxodiff;
pub mod utxodiffstore;
pub mod utxoset;
pub mod virtualblock;

pub use dag::{
    BehaviorFlags, BlockDag, BlockTemplate, Config, ProcessResult, SequenceLock, BF_AFTER_DELAY,
    BF_FAST_ADD, BF_NONE, BF_NO_POW_CHECK, BF_WAS_STORED, BF_WAS_UNORPHANED,
};
pub use error::{DagError, RuleError};
pub use interfaces::{
    IndexManager, Mempool, ScriptVerifier, SigCache, SystemTimeSource, TimeSource,
};
pub use notifications::{ConsensusNotifier, Notification};
pub use params::{Network, Params};
