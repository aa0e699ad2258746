//! Global deadlock detection
//!
//! Cross-shard deadlocks are invisible to any single storage engine: each
//! shard sees an ordinary lock wait. This crate merges every shard's
//! lock-wait diagnostics into one wait-for graph over global transaction
//! ids, finds cycles spanning two or more shards, and breaks each by
//! killing one victim's branches.

mod detector;
pub mod diag;
mod error;
pub mod graph;
pub mod policy;

pub use detector::{DeadlockDetector, DetectorConfig, PassReport};
pub use error::{DetectorError, Result};
pub use policy::VictimPolicy;
