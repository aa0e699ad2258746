//! Global transaction identifier
//!
//! A distributed transaction is identified by the compute node that started
//! it, its start time, and the node-local transaction id. The literal form
//! `"<node>-<ts>-<txn>"` is what travels inside XA commands and what the
//! shards report back in their lock-wait diagnostics.

use crate::CompNodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a distributed transaction, globally unique across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTxnId {
    /// Compute node that coordinates the transaction.
    pub comp_node: CompNodeId,
    /// Transaction start time, unix seconds.
    pub start_ts: i64,
    /// Transaction id local to the compute node.
    pub local_txn: u32,
}

/// Failure to parse a global transaction id literal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid global transaction id literal: {0:?}")]
pub struct TxnIdParseError(pub String);

impl GlobalTxnId {
    pub fn new(comp_node: CompNodeId, start_ts: i64, local_txn: u32) -> Self {
        Self {
            comp_node,
            start_ts,
            local_txn,
        }
    }

    /// Parse an id as it appears in shard diagnostics, where the literal is
    /// wrapped in single quotes (`'1-1650000000-7'`).
    pub fn from_diag_literal(s: &str) -> Result<Self, TxnIdParseError> {
        s.trim().trim_matches('\'').parse()
    }
}

impl fmt::Display for GlobalTxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.comp_node, self.start_ts, self.local_txn)
    }
}

impl FromStr for GlobalTxnId {
    type Err = TxnIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TxnIdParseError(s.to_string());
        let mut parts = s.splitn(3, '-');
        let comp_node = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(err)?;
        let start_ts = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(err)?;
        let local_txn = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(err)?;
        Ok(Self {
            comp_node: CompNodeId(comp_node),
            start_ts,
            local_txn,
        })
    }
}
