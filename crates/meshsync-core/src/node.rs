//! Peer identity records.
//!
//! A `Node` is created on first sighting and shared between the registry,
//! the messages it originated, and in-flight sync bookkeeping. Mutable
//! state is internally synchronized; the registry serializes structural
//! changes (creation, replacement, removal).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::crypto::PublicKey;
use crate::types::{Contact, NodeUid};

#[derive(Debug)]
struct NodeDetails {
    /// Ordered contacts, first is preferred.
    contacts: Vec<Contact>,
    /// Identity key. Immutable once set.
    public_key: Option<PublicKey>,
    /// Wall-clock timestamp (ms) of the newest message seen from this node.
    latest_message_ms: i64,
    /// Rendezvous contact for tunnelling, when the node is unreachable.
    rendezvous: Option<Contact>,
}

/// Identity record for a peer.
#[derive(Debug)]
pub struct Node {
    uid: NodeUid,
    details: Mutex<NodeDetails>,
    /// Monotonic ms of the last successful exchange; 0 = never.
    last_alive_ms: AtomicU64,
    /// Consecutive failures since the last success.
    fail_count: AtomicU32,
    /// Monotonic ms of the last tunnel attempt; 0 = never.
    last_tunnel_ms: AtomicU64,
}

impl Node {
    /// Create a node from its first sighting.
    pub fn new(contact: Contact, uid: NodeUid, public_key: Option<PublicKey>) -> Self {
        Self {
            uid,
            details: Mutex::new(NodeDetails {
                contacts: vec![contact],
                public_key,
                latest_message_ms: 0,
                rendezvous: None,
            }),
            last_alive_ms: AtomicU64::new(0),
            fail_count: AtomicU32::new(0),
            last_tunnel_ms: AtomicU64::new(0),
        }
    }

    /// The stable 8-byte peer id.
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// The identity key, if one has been learned.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.details.lock().unwrap().public_key
    }

    /// The preferred contact.
    pub fn contact(&self) -> Contact {
        self.details.lock().unwrap().contacts[0].clone()
    }

    /// The preferred contact's resolved address.
    pub fn address(&self) -> String {
        self.details.lock().unwrap().contacts[0].address.clone()
    }

    /// Attach a verified public key, replacing the contact list.
    ///
    /// Returns false if a different key is already set; key identity is
    /// authoritative, so the caller must treat that as a distinct node.
    pub fn set_key_details(&self, contact: Contact, public_key: PublicKey) -> bool {
        let mut details = self.details.lock().unwrap();
        if let Some(existing) = details.public_key {
            return existing == public_key;
        }
        details.contacts = vec![contact];
        details.public_key = Some(public_key);
        true
    }

    /// Adopt a fresher contact carried by a newer message.
    pub fn update_contact(&self, contact: Contact, message_ms: i64) {
        let mut details = self.details.lock().unwrap();
        details.contacts = vec![contact];
        details.latest_message_ms = message_ms;
    }

    /// Wall-clock timestamp of the newest message seen from this node.
    pub fn latest_message_ms(&self) -> i64 {
        self.details.lock().unwrap().latest_message_ms
    }

    /// Reorder the first two contacts to honour an address-family hint.
    ///
    /// Returns true if a change was made.
    pub fn apply_ipv6_hint(&self, prefer_v6: bool) -> bool {
        let mut details = self.details.lock().unwrap();
        if details.contacts.len() < 2 {
            return false;
        }
        let v6_first = details.contacts[0].is_ipv6();
        let v6_second = details.contacts[1].is_ipv6();
        if v6_first == v6_second || v6_first == prefer_v6 {
            return false;
        }
        details.contacts.swap(0, 1);
        true
    }

    /// Record a successful exchange.
    pub fn mark_ok(&self, now_ms: u64) {
        self.last_alive_ms.store(now_ms, Ordering::Relaxed);
        self.fail_count.store(0, Ordering::Relaxed);
    }

    /// Record a failed exchange.
    pub fn mark_failed(&self) {
        self.fail_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Consecutive failures since the last success.
    pub fn fail_count(&self) -> u32 {
        self.fail_count.load(Ordering::Relaxed)
    }

    /// Monotonic ms of the last successful exchange; 0 = never seen alive.
    pub fn last_alive_ms(&self) -> u64 {
        self.last_alive_ms.load(Ordering::Relaxed)
    }

    /// True when the node has succeeded at least once and is not failing.
    pub fn is_live(&self) -> bool {
        self.fail_count() == 0 && self.last_alive_ms() > 0
    }

    /// Set the rendezvous contact used for tunnelling.
    pub fn set_rendezvous(&self, rendezvous: Option<Contact>) {
        self.details.lock().unwrap().rendezvous = rendezvous;
    }

    /// Rendezvous contact, if one is known.
    pub fn rendezvous(&self) -> Option<Contact> {
        self.details.lock().unwrap().rendezvous.clone()
    }

    /// Monotonic ms of the last tunnel attempt.
    pub fn last_tunnel_ms(&self) -> u64 {
        self.last_tunnel_ms.load(Ordering::Relaxed)
    }

    /// Record a tunnel attempt.
    pub fn set_last_tunnel_ms(&self, now_ms: u64) {
        self.last_tunnel_ms.store(now_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn contact(addr: &str) -> Contact {
        Contact::from_address(addr)
    }

    #[test]
    fn test_key_immutable_once_set() {
        let node = Node::new(contact("10.0.0.1:1"), NodeUid::random(), None);
        let key_a = Keypair::generate().public_key();
        let key_b = Keypair::generate().public_key();

        assert!(node.set_key_details(contact("10.0.0.1:1"), key_a));
        assert!(node.set_key_details(contact("10.0.0.2:1"), key_a));
        assert!(!node.set_key_details(contact("10.0.0.1:1"), key_b));
        assert_eq!(node.public_key(), Some(key_a));
    }

    #[test]
    fn test_fail_ok_cycle() {
        let node = Node::new(contact("10.0.0.1:1"), NodeUid::random(), None);
        assert!(!node.is_live());
        node.mark_failed();
        node.mark_failed();
        assert_eq!(node.fail_count(), 2);
        node.mark_ok(100);
        assert_eq!(node.fail_count(), 0);
        assert!(node.is_live());
    }

    #[test]
    fn test_ipv6_hint_reorders() {
        let node = Node::new(contact("10.0.0.1:1"), NodeUid::random(), None);
        {
            let mut details = node.details.lock().unwrap();
            details.contacts.push(contact("[::1]:1"));
        }
        assert!(node.apply_ipv6_hint(true));
        assert!(node.contact().is_ipv6());
        // already preferred, nothing to do
        assert!(!node.apply_ipv6_hint(true));
    }
}
