//! Error types for trellis-sync

use thiserror::Error;
use trellis_core::Value;

/// Sync error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The transport reported a failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// The response body had an unusable shape
    #[error("malformed response: {0}")]
    BadResponse(String),

    /// Validation rejected the mutation
    #[error("rejected by validation: {0}")]
    Rejected(Value),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
