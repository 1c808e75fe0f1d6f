//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Message primitive error.
    #[error("core error: {0}")]
    Core(#[from] meshsync_core::CoreError),

    /// Persisted state serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisted state failed to decode.
    #[error("invalid persisted state: {0}")]
    InvalidData(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
