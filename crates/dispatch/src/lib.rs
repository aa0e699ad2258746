//! Statement dispatch
//!
//! Per-shard FIFO statement queues over the connection pool, with at most
//! one round trip in flight per connection and a single multiplexed wait
//! across all of them. The transaction coordinator drives one of these per
//! backend flow; the deadlock detector drives its own.

mod dispatcher;
mod error;
mod job;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DispatchError, Result};
pub use job::{JobHandle, JobStatus, StatementJob};
