//! Shard connection pool
//!
//! Owns one connection per (shard, node), tracks valid/reset state, and
//! bundles the session preamble into the first round trip on fresh or reset
//! connections. The wire itself sits behind the `ShardConnector` /
//! `ShardSession` traits so the rest of the compute node never sees a
//! concrete client library; `mock` provides the in-process implementation
//! the whole workspace tests against.

mod error;
pub mod mock;
mod pool;
mod preamble;
mod topology;
mod wire;

pub use error::{PoolError, Result};
pub use pool::{PooledConn, ShardPool, Target};
pub use preamble::{Preamble, SessionVars};
pub use topology::{ShardNode, ShardTopology, StaticTopology};
pub use wire::{split_batch, Reply, Row, ShardConnector, ShardSession};
