//! # meshsync core
//!
//! Pure primitives for the meshsync engine: signed messages, peer identity
//! records, bloom filters, and rate tracking.
//!
//! This crate contains no I/O and no networking. Time enters exclusively
//! through function arguments (monotonic/wall milliseconds) so everything
//! here is deterministic under test.
//!
//! ## Key Types
//!
//! - [`Message`] - a signed, immutable channel message with provenance history
//! - [`Node`] - identity record for a peer
//! - [`BloomFilter`] - the masked set summary exchanged during reconciliation
//! - [`Keypair`] / [`PublicKey`] / [`Signature`] - Ed25519 identities

pub mod average;
pub mod bloom;
pub mod crypto;
pub mod error;
pub mod message;
pub mod node;
pub mod types;

pub use average::{MovingAverage, RollingRate};
pub use bloom::{BloomFilter, CountingBloomFilter};
pub use crypto::{Keypair, PublicKey, Signature};
pub use error::CoreError;
pub use message::{extend_history, history_hops, Message, MessageKind, SourceKind};
pub use node::Node;
pub use types::{limits, Contact, HopId, MessageId, NodeUid, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
