//! Error types for the protocol module.

use thiserror::Error;

/// Errors that can occur in the wire protocol and sync machinery.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Payload failed to decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// Payload failed to encode.
    #[error("encode error: {0}")]
    Encode(String),

    /// Peer speaks a protocol version we no longer accept.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Compressed payload expands past the safety bound.
    #[error("decompressed payload too large")]
    DecompressBomb,

    /// Channel crypto failure.
    #[error("channel error: {0}")]
    Channel(#[from] meshsync_channel::ChannelError),

    /// Core primitive error.
    #[error("core error: {0}")]
    Core(#[from] meshsync_core::CoreError),

    /// The transport has not finished initializing. Transient.
    #[error("transport not initialized")]
    TransportUninitialized,

    /// A transport request timed out. Transient.
    #[error("transport timeout")]
    Timeout,

    /// The worker pool has no free permits. Transient; retried next tick.
    #[error("worker pool saturated")]
    PoolSaturated,

    /// Generic transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtoError {
    /// Transient errors resolve on their own and are retried on a later
    /// tick. Of these only `Timeout` counts against the peer that failed
    /// to answer; the others reflect purely local conditions.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProtoError::TransportUninitialized | ProtoError::Timeout | ProtoError::PoolSaturated
        )
    }
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
