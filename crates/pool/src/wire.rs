//! Wire seam to a shard's native client/server protocol
//!
//! Textual SQL, non-blocking connect/send/receive, one outstanding result
//! per connection. A batch is one network round trip; multi-statement
//! batches come back as one `Reply` per statement, in order.

use crate::error::Result;
use crate::topology::ShardNode;
use async_trait::async_trait;
use tessera_common::{ServerError, ShardId};

/// One row of a textual result set; NULLs are `None`.
pub type Row = Vec<Option<String>>;

/// Outcome of one statement within a round trip.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Statement executed; no result set.
    Done { affected_rows: u64, warnings: u32 },
    /// SELECT-class statement; the fully drained result set.
    Rows(Vec<Row>),
    /// Server-side SQL error. The connection remains usable.
    Err(ServerError),
}

impl Reply {
    pub fn is_err(&self) -> bool {
        matches!(self, Reply::Err(_))
    }
}

/// A live session with one shard node. Owned exclusively by one dispatcher
/// channel; never shared.
#[async_trait]
pub trait ShardSession: Send {
    /// Server-side connection id, the target of `KILL QUERY`.
    fn connection_id(&self) -> u32;

    /// Send a (possibly multi-statement) batch and await all replies.
    ///
    /// Dropping the returned future mid-flight leaves the wire in an
    /// undefined state; the caller must tear the session down afterwards.
    async fn round_trip(&mut self, batch: &str) -> Result<Vec<Reply>>;
}

/// Connection factory over the shard's native protocol.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, shard: ShardId, node: &ShardNode) -> Result<Box<dyn ShardSession>>;
}

/// Split a batch into its statements, for implementations and tests that
/// need per-statement handling. Quoted text never contains `;` on this
/// wire (global txn id literals are `-`-separated), so a plain split is
/// exact.
pub fn split_batch(batch: &str) -> Vec<&str> {
    batch
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_batch() {
        let stmts = split_batch("XA END '1-2-3';XA COMMIT '1-2-3' ONE PHASE");
        assert_eq!(stmts, vec!["XA END '1-2-3'", "XA COMMIT '1-2-3' ONE PHASE"]);
        assert_eq!(split_batch("SELECT 1"), vec!["SELECT 1"]);
        assert!(split_batch("").is_empty());
    }
}
