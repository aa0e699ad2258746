//! Error types for the coordinator

use tessera_common::{GlobalTxnId, ShardId};
use tessera_dispatch::DispatchError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Statement-level failure bubbled up from the dispatcher.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("no transaction is active")]
    NoActiveTransaction,

    #[error("invalid transaction state: {0}")]
    InvalidState(String),

    /// A participant voted no (or vanished) during phase one; the whole
    /// transaction has been rolled back.
    #[error("prepare failed on shard {shard}: {reason}")]
    PrepareFailed { shard: ShardId, reason: String },

    /// The transaction could not commit and has been aborted. Retryable as
    /// a whole.
    #[error("transaction {txn} aborted: {reason}")]
    TxnAborted { txn: GlobalTxnId, reason: String },

    /// A broken assumption inside the coordinator itself. Fatal, never
    /// retried.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
