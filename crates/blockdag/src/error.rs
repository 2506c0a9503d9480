//! Error taxonomy of the consensus core.
//!
//! `RuleError` covers protocol violations attributable to the block
//! itself. `DagError::Corruption` marks inconsistencies between stores;
//! it is never recovered from inside the core and the process supervisor
//! is expected to terminate on it.

use dagd_consensus::{hash256_to_hex, Hash256};
use dagd_primitives::outpoint::OutPoint;
use dagd_storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    DuplicateBlock(Hash256),
    ParentBlockUnknown(Hash256),
    InvalidAncestorBlock(Hash256),
    TooManyParents(usize),
    BadMerkleRoot,
    BadAcceptedIdMerkleRoot,
    BadUtxoCommitment,
    MissingTxOutput(OutPoint),
    ImmatureSpend(OutPoint),
    SequenceLockNotMet(Hash256),
    UnfinalizedTx(Hash256),
    BadCoinbaseValue,
    BadCoinbasePayload,
    InvalidGas(&'static str),
    FinalityViolation,
    TimeTooOld,
    WrongDifficulty { expected: u32, actual: u32 },
    HighHash,
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleError::DuplicateBlock(hash) => {
                write!(f, "already have block {}", hash256_to_hex(hash))
            }
            RuleError::ParentBlockUnknown(hash) => {
                write!(f, "parent block {} is unknown", hash256_to_hex(hash))
            }
            RuleError::InvalidAncestorBlock(hash) => {
                write!(f, "parent block {} is known to be invalid", hash256_to_hex(hash))
            }
            RuleError::TooManyParents(count) => {
                write!(f, "block references {count} parents")
            }
            RuleError::BadMerkleRoot => write!(f, "block merkle root mismatch"),
            RuleError::BadAcceptedIdMerkleRoot => {
                write!(f, "accepted ID merkle root mismatch")
            }
            RuleError::BadUtxoCommitment => write!(f, "UTXO commitment mismatch"),
            RuleError::MissingTxOutput(outpoint) => write!(
                f,
                "output {}:{} does not exist or has already been spent",
                hash256_to_hex(&outpoint.tx_id),
                outpoint.index
            ),
            RuleError::ImmatureSpend(outpoint) => write!(
                f,
                "coinbase output {}:{} spent before maturity",
                hash256_to_hex(&outpoint.tx_id),
                outpoint.index
            ),
            RuleError::SequenceLockNotMet(tx_id) => write!(
                f,
                "transaction {} sequence locks are not yet satisfied",
                hash256_to_hex(tx_id)
            ),
            RuleError::UnfinalizedTx(tx_id) => {
                write!(f, "transaction {} is not finalized", hash256_to_hex(tx_id))
            }
            RuleError::BadCoinbaseValue => write!(f, "coinbase pays more than allowed"),
            RuleError::BadCoinbasePayload => {
                write!(f, "coinbase payload does not commit to the block's blue score")
            }
            RuleError::InvalidGas(message) => write!(f, "{message}"),
            RuleError::FinalityViolation => write!(
                f,
                "the last finality point is not in the selected parent chain of this block"
            ),
            RuleError::TimeTooOld => {
                write!(f, "block timestamp is not after the past median time")
            }
            RuleError::WrongDifficulty { expected, actual } => write!(
                f,
                "block difficulty {actual:#010x} does not match required {expected:#010x}"
            ),
            RuleError::HighHash => write!(f, "block hash is above the target difficulty"),
            RuleError::InvalidBlock(message) => write!(f, "{message}"),
            RuleError::InvalidTransaction(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for RuleError {}

#[derive(Debug)]
pub enum DagError {
    Rule(RuleError),
    NotInDag(Hash256),
    Store(StoreError),
    Corruption(String),
    Interrupted,
}

impl DagError {
    pub fn is_rule_error(&self) -> bool {
        matches!(self, DagError::Rule(_))
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        DagError::Corruption(message.into())
    }
}

impl std::fmt::Display for DagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DagError::Rule(err) => write!(f, "{err}"),
            DagError::NotInDag(hash) => {
                write!(f, "block {} is not in the DAG", hash256_to_hex(hash))
            }
            DagError::Store(err) => write!(f, "{err}"),
            DagError::Corruption(message) => write!(f, "state corruption: {message}"),
            DagError::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for DagError {}

impl From<RuleError> for DagError {
    fn from(err: RuleError) -> Self {
        DagError::Rule(err)
    }
}

impl From<StoreError> for DagError {
    fn from(err: StoreError) -> Self {
        DagError::Store(err)
    }
}
