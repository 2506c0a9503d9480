//! Wire-level primitive types: blocks, transactions, outpoints, and the
//! consensus serialization codec.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod subnetwork;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use outpoint::OutPoint;
pub use subnetwork::SubnetworkId;
pub use transaction::{Transaction, TxIn, TxOut};
