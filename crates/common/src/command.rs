//! Statement command classification

use serde::{Deserialize, Serialize};

/// What a queued statement does on the shard, as far as the dispatcher and
/// coordinator care: result handling and branch bookkeeping differ per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// SELECT-class statement; produces a result set that must be drained
    /// or released before the connection takes its next job.
    Read,
    /// INSERT/UPDATE/DELETE; affected rows feed the branch's write counter.
    Write,
    /// DDL; must be the sole participant of its distributed transaction.
    Ddl,
    /// XA / savepoint / KILL plumbing; never counts as a branch access.
    TxnControl,
}

impl CommandKind {
    /// Whether a completed statement of this kind holds a result set.
    pub fn returns_rows(self) -> bool {
        matches!(self, CommandKind::Read)
    }

    /// Whether this kind marks the branch as accessed by user work.
    pub fn is_access(self) -> bool {
        !matches!(self, CommandKind::TxnControl)
    }
}
