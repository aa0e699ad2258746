//! Common types for the tessera compute node
//!
//! This crate defines:
//! - Shard, node and compute-node identifiers
//! - Global transaction IDs (`"<node>-<ts>-<txn>"` literals)
//! - Statement command kinds
//! - The `ClusterRuntime` context shared between backends and the
//!   global deadlock detector

mod command;
mod error;
mod ids;
mod runtime;
mod txn_id;

pub use command::CommandKind;
pub use error::ServerError;
pub use ids::{CompNodeId, NodeId, ShardId};
pub use runtime::ClusterRuntime;
pub use txn_id::{GlobalTxnId, TxnIdParseError};

/// Derive the wire name for a nested subtransaction's savepoint.
///
/// The name is deterministic so that begin/release/rollback of the same
/// subtransaction always address the same savepoint on every shard.
pub fn savepoint_name(sub_id: u32) -> String {
    format!("sp{sub_id}")
}
