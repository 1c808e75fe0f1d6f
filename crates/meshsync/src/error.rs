//! Error types for the engine.

use thiserror::Error;

/// Errors surfaced by the sync engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Protocol layer failure.
    #[error("protocol error: {0}")]
    Proto(#[from] meshsync_proto::ProtoError),

    /// Channel crypto or handshake failure.
    #[error("channel error: {0}")]
    Channel(#[from] meshsync_channel::ChannelError),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] meshsync_store::StoreError),

    /// Core primitive failure.
    #[error("core error: {0}")]
    Core(#[from] meshsync_core::CoreError),

    /// A peer answered with something other than the expected message.
    #[error("unexpected reply from peer")]
    UnexpectedReply,

    /// The local store refused the message (read-only channel, replay).
    #[error("message rejected: {0}")]
    SendRejected(&'static str),

    /// The responder refused the key exchange.
    #[error("handshake refused: {0}")]
    HandshakeRefused(String),

    /// The engine has been destroyed.
    #[error("engine destroyed")]
    Destroyed,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
