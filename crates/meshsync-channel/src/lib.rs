//! # meshsync channel
//!
//! Channel cryptography above the core primitives: the symmetric secrets
//! sealing wire payloads and persisted content, and the station-to-station
//! key exchange that establishes pairwise secrets for private chats.

pub mod error;
pub mod handshake;
pub mod secret;

pub use error::{ChannelError, Result};
pub use handshake::{ActivityId, HandshakeConfig, HandshakeEngine, HandshakeMessage};
pub use secret::{ChannelSecret, KexPublic, KexSecret};
