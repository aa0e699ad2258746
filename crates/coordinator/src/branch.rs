//! Per-shard transaction branches

use tessera_common::{CommandKind, ShardId};

/// How far a shard branch has been drawn into the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BranchState {
    /// Registered but no statement has run yet.
    Unaccessed,
    /// Read from, or written without an acknowledged write statement.
    ReadOrUnwritten,
    /// A write statement has run on this branch.
    Written,
}

/// One shard's participation in a global transaction.
#[derive(Debug)]
pub struct TransactionBranch {
    pub shard: ShardId,
    pub state: BranchState,
    pub did_write: bool,
    /// Rows actually changed by this branch's write statements.
    pub rows_written: u64,
    pub executed_ddl: bool,
}

impl TransactionBranch {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            state: BranchState::Unaccessed,
            did_write: false,
            rows_written: 0,
            executed_ddl: false,
        }
    }

    /// Record a completed statement against this branch.
    pub fn note_access(&mut self, kind: CommandKind, affected_rows: u64) {
        match kind {
            CommandKind::Read => {
                if self.state == BranchState::Unaccessed {
                    self.state = BranchState::ReadOrUnwritten;
                }
            }
            CommandKind::Write => {
                self.did_write = true;
                self.rows_written += affected_rows;
                self.state = BranchState::Written;
            }
            CommandKind::Ddl => {
                self.did_write = true;
                self.executed_ddl = true;
                self.state = BranchState::Written;
            }
            CommandKind::TxnControl => {}
        }
    }

    pub fn accessed(&self) -> bool {
        self.state != BranchState::Unaccessed
    }

    /// A branch only forces two-phase commit when its writes changed rows;
    /// a write statement that matched nothing leaves the branch eligible
    /// for one-phase commit.
    pub fn wrote_rows(&self) -> bool {
        self.did_write && self.rows_written > 0
    }
}
