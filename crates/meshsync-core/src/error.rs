//! Error types for core primitives.

use thiserror::Error;

/// Errors arising from core primitive operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A public key could not be parsed.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// A signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// Message content exceeds the wire limit.
    #[error("content too large: {size} > {max}")]
    ContentTooLarge { size: usize, max: usize },

    /// A fixed-size identifier had the wrong length.
    #[error("invalid length for {what}: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
