//! Error types for the deadlock detector

use tessera_dispatch::DispatchError;
use thiserror::Error;

/// Detector error types. These never reach user transactions; the run loop
/// logs them and backs off.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Result type for detector operations
pub type Result<T> = std::result::Result<T, DetectorError>;
