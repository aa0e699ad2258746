//! Error types for the connection pool and wire seam

use tessera_common::{NodeId, ShardId};
use thiserror::Error;

/// Result type for pool and wire operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Transport-level failures. A server-side SQL error is not a `PoolError`;
/// it travels back as a `Reply::Err` and leaves the connection usable.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// Shard unreachable or connection lost mid-statement. The connection is
    /// torn down and a topology re-check is scheduled; retryable.
    #[error("shard {shard} unreachable: {reason}")]
    Connectivity { shard: ShardId, reason: String },

    /// Malformed or out-of-sync reply stream. Fatal for the current
    /// statement; the connection is torn down.
    #[error("protocol error on shard {shard}: {reason}")]
    Protocol { shard: ShardId, reason: String },

    /// The node answered the primary-role probe as a replica. The caller
    /// must disconnect, re-check topology, and retry the whole transaction.
    #[error("shard {shard} node {node} is no longer primary")]
    StaleTopology { shard: ShardId, node: NodeId },

    /// Topology has no entry for the shard.
    #[error("unknown shard {0}")]
    UnknownShard(ShardId),
}

impl PoolError {
    /// Whether the connection that produced this error must be torn down.
    pub fn tears_down_connection(&self) -> bool {
        matches!(
            self,
            PoolError::Connectivity { .. }
                | PoolError::Protocol { .. }
                | PoolError::StaleTopology { .. }
        )
    }
}
