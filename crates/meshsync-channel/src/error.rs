//! Error types for the channel module.

use thiserror::Error;

/// Errors that can occur during key exchange and channel crypto.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Payload could not be sealed.
    #[error("encryption failed")]
    EncryptFailed,

    /// Ciphertext failed to authenticate or decrypt.
    #[error("decryption failed")]
    DecryptFailed,

    /// Ciphertext too short to carry a nonce.
    #[error("ciphertext truncated: {0} bytes")]
    CiphertextTruncated(usize),

    /// Peer's handshake authentication tag did not verify.
    #[error("handshake authentication failed")]
    AuthFailed,

    /// The negotiated identity is not the key we set out to reach.
    /// Fatal: the session must not be retried.
    #[error("remote identity key mismatch")]
    KeyMismatch,

    /// No handshake activity under the given id.
    #[error("unknown handshake activity {0}")]
    UnknownActivity(String),

    /// Handshake message arrived out of sequence.
    #[error("unexpected handshake state: {0}")]
    BadState(&'static str),

    /// Too many concurrent attempts from one address.
    #[error("too many handshake attempts from address")]
    AddressOverloaded,

    /// Too many concurrent handshake activities overall.
    #[error("too many concurrent handshake activities")]
    TooManyActivities,

    /// Core primitive error.
    #[error("core error: {0}")]
    Core(#[from] meshsync_core::CoreError),
}

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
