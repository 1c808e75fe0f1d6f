//! Identifier newtypes and protocol constants.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 5;

/// Oldest protocol version we still answer.
pub const MIN_PROTOCOL_VERSION: u8 = 4;

/// Hard limits shared across the protocol.
pub mod limits {
    /// Maximum live messages retained per channel.
    pub const MAX_MESSAGES: usize = 128;
    /// Maximum remembered signatures of evicted messages.
    pub const MAX_DELETED_MESSAGES: usize = 128;
    /// Maximum tracked nodes per channel.
    pub const MAX_NODES: usize = 128;
    /// Node count never pruned below this.
    pub const MIN_NODES: usize = 3;
    /// Maximum message content size in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 600;
    /// Byte budget for content+control across one sync reply.
    pub const MAX_REPLY_BYTES: usize = 4 * 1024;
    /// Maximum provenance history length in bytes (20 hops).
    pub const MAX_HISTORY_LEN: usize = 80;
    /// Smallest bloom filter we will build, in bits.
    pub const MIN_BLOOM_BITS: usize = 64;
    /// Maximum concurrently active outbound syncs.
    pub const MAX_CONC_SYNC: usize = 5;
    /// Active syncs that may be failing before we force a not-failed pick.
    pub const MAX_FAIL_SYNC: usize = 2;
}

/// Stable 8-byte identifier for a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeUid(pub [u8; 8]);

impl NodeUid {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a random uid.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", hex::encode(self.0))
    }
}

/// 8-byte random identifier for a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; 8]);

impl MessageId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a random message id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({})", hex::encode(self.0))
    }
}

/// 4-byte fingerprint of a relay hop, as recorded in provenance history.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HopId(pub [u8; 4]);

impl HopId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Derive the fingerprint of a transport address.
    pub fn from_address(address: &str) -> Self {
        let hash = blake3::hash(address.as_bytes());
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&hash.as_bytes()[..4]);
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for HopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hop({})", hex::encode(self.0))
    }
}

/// A transport contact: the resolved address plus the transport's own
/// opaque export, carried verbatim on the wire and in persisted state.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    /// Resolved `host:port` form, used for identity dedup and fingerprints.
    pub address: String,
    /// Opaque transport export blob.
    pub blob: Vec<u8>,
}

impl Contact {
    /// Build a contact from its resolved address with no transport blob.
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            blob: Vec::new(),
        }
    }

    /// True when this contact's address family is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.address.starts_with('[') || self.address.matches(':').count() > 1
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({})", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_id_stable() {
        let a = HopId::from_address("10.0.0.1:6881");
        let b = HopId::from_address("10.0.0.1:6881");
        assert_eq!(a, b);
        assert_ne!(a, HopId::from_address("10.0.0.2:6881"));
    }

    #[test]
    fn test_contact_family() {
        assert!(!Contact::from_address("10.0.0.1:6881").is_ipv6());
        assert!(Contact::from_address("[::1]:6881").is_ipv6());
    }

    #[test]
    fn test_uid_random_distinct() {
        assert_ne!(NodeUid::random(), NodeUid::random());
    }
}
