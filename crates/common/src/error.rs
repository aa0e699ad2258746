//! Server-side SQL error payload

use serde::{Deserialize, Serialize};
use std::fmt;

/// An SQL-level error returned by a shard.
///
/// The connection that produced it remains usable; the error is propagated
/// verbatim to the SQL client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Native error code reported by the shard.
    pub code: u32,
    /// Human-readable message, passed through unmodified.
    pub message: String,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}
