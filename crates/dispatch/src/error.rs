//! Error types for the statement dispatcher

use std::time::Duration;
use tessera_common::{ServerError, ShardId};
use tessera_pool::PoolError;
use thiserror::Error;

/// Result type for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced per job or per flush.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// Transport-level failure; the connection was torn down and a topology
    /// re-check scheduled. Retryable at statement or transaction level.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// SQL-level error from the shard, propagated verbatim. The connection
    /// stays alive.
    #[error("shard {shard}: {error}")]
    Server { shard: ShardId, error: ServerError },

    /// The multiplexed wait hit the minimum connection deadline; the
    /// cancellation policy has already run.
    #[error("statement timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The job was dropped before being sent (cancellation, or an earlier
    /// failure on the same connection).
    #[error("statement cancelled before completion")]
    Cancelled,

    /// Dispatcher invariant violation; indicates a bug upstream.
    #[error("internal dispatcher error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Whether the owning transaction must abort but may be retried whole.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DispatchError::Pool(_) | DispatchError::Timeout { .. } | DispatchError::Cancelled
        )
    }

    /// Native server error code, when this is a server-side SQL error.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            DispatchError::Server { error, .. } => Some(error.code),
            _ => None,
        }
    }
}
