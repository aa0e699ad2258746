//! Cross-shard transaction coordination
//!
//! Tracks the shard branches a transaction touches, decides between XA
//! one-phase and two-phase commit from how many branches actually changed
//! rows, and drives savepoints and aborts across all branches through the
//! statement dispatcher.

mod branch;
mod coordinator;
mod error;

pub use branch::{BranchState, TransactionBranch};
pub use coordinator::{CommitOutcome, TxnCoordinator};
pub use error::{CoordinatorError, Result};
