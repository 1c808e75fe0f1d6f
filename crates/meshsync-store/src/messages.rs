//! Bounded, age-ordered message store with replay protection.
//!
//! The store holds at most `max_messages` live messages ordered oldest
//! first (largest age at the front). Evicted messages leave a bit-inverted
//! signature tombstone behind in a bounded deleted-set so they cannot be
//! replayed back in by a lagging peer.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use tracing::debug;

use meshsync_core::{limits, Message, PublicKey, Signature, SourceKind};

/// Tuning knobs for the message store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum live messages retained.
    pub max_messages: usize,
    /// Maximum eviction tombstones retained.
    pub max_deleted: usize,
    /// When set, only this key (or control messages) may appear in the
    /// channel.
    pub read_only_owner: Option<PublicKey>,
    /// Fraction of the store a message must land beyond to count as "new"
    /// traffic. Not load-bearing; affects only the busy-channel heuristic.
    pub new_message_fraction: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: limits::MAX_MESSAGES,
            max_deleted: limits::MAX_DELETED_MESSAGES,
            read_only_owner: None,
            new_message_fraction: 0.5,
        }
    }
}

/// Outcome of an [`MessageStore::add`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Message inserted and retained.
    Accepted,
    /// Exact signature already present.
    DuplicateSignature,
    /// The inverted signature is tombstoned; this is a replay.
    Tombstoned,
    /// Read-only channel and the originator is not the owner.
    ReadOnly,
    /// Inserted as the oldest element of a full store and immediately
    /// evicted. A tombstone was still recorded.
    EvictedImmediately,
}

impl AddOutcome {
    /// True when the message is now retained in the store.
    pub fn is_accepted(&self) -> bool {
        matches!(self, AddOutcome::Accepted)
    }
}

struct StoreInner {
    /// Oldest first: ages are non-increasing from front to back.
    messages: VecDeque<Arc<Message>>,
    live_sigs: HashSet<Signature>,
    /// Inverted signatures of evicted messages.
    deleted: HashSet<Signature>,
    deleted_order: VecDeque<Signature>,
    mutation_count: u64,
    new_message_count: u64,
}

/// Bounded ordered message store.
pub struct MessageStore {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
}

impl MessageStore {
    /// Create an empty store.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(StoreInner {
                messages: VecDeque::new(),
                live_sigs: HashSet::new(),
                deleted: HashSet::new(),
                deleted_order: VecDeque::new(),
                mutation_count: 0,
                new_message_count: 0,
            }),
        }
    }

    /// Attempt to add a message, keeping the store age-ordered and bounded.
    ///
    /// `now_ms` is the monotonic clock used to re-derive message ages for
    /// the ordering scan.
    pub fn add(&self, message: Arc<Message>, source: SourceKind, now_ms: u64) -> AddOutcome {
        let mut inner = self.inner.write().unwrap();

        let sig = *message.signature();
        if inner.live_sigs.contains(&sig) {
            return AddOutcome::DuplicateSignature;
        }
        if inner.deleted.contains(&sig.inverted()) {
            return AddOutcome::Tombstoned;
        }
        if let Some(owner) = self.config.read_only_owner {
            if message.control().is_none() && message.node().public_key() != Some(owner) {
                return AddOutcome::ReadOnly;
            }
        }

        // Scan from the newest end backward for the first entry at least as
        // old as the new message; insert just after it.
        let age = message.age_secs(now_ms);
        let num_before = inner.messages.len();
        let mut insert_at = 0;
        for i in (0..num_before).rev() {
            if inner.messages[i].age_secs(now_ms) >= age {
                insert_at = i + 1;
                break;
            }
        }

        inner.messages.insert(insert_at, Arc::clone(&message));
        inner.live_sigs.insert(sig);
        inner.mutation_count += 1;

        let mut self_evicted = false;
        while inner.messages.len() > self.config.max_messages {
            if let Some(oldest) = inner.messages.pop_front() {
                let oldest_sig = *oldest.signature();
                inner.live_sigs.remove(&oldest_sig);
                record_tombstone(&mut inner, oldest_sig.inverted(), self.config.max_deleted);
                if Arc::ptr_eq(&oldest, &message) {
                    self_evicted = true;
                }
                debug!(evicted = ?oldest_sig, "store full, evicted oldest message");
            }
        }

        if self_evicted {
            return AddOutcome::EvictedImmediately;
        }

        if source != SourceKind::Loading {
            let threshold = (num_before as f64 * self.config.new_message_fraction) as usize;
            if insert_at > threshold {
                inner.new_message_count += 1;
            }
        }

        AddOutcome::Accepted
    }

    /// Number of live messages.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().messages.len()
    }

    /// True when no messages are retained.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().messages.is_empty()
    }

    /// Counter bumped on every structural change; used to invalidate the
    /// reconciliation snapshot and to skip no-op persistence saves.
    pub fn mutation_count(&self) -> u64 {
        self.inner.read().unwrap().mutation_count
    }

    /// Count of non-loading insertions that landed in the newer region of
    /// the store. A busy channel has pushed this past the store capacity.
    pub fn new_message_count(&self) -> u64 {
        self.inner.read().unwrap().new_message_count
    }

    /// Clone the live message list, oldest first.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.inner.read().unwrap().messages.iter().cloned().collect()
    }

    /// Look up a live message by signature.
    pub fn get_by_signature(&self, sig: &Signature) -> Option<Arc<Message>> {
        let inner = self.inner.read().unwrap();
        if !inner.live_sigs.contains(sig) {
            return None;
        }
        inner
            .messages
            .iter()
            .find(|m| m.signature() == sig)
            .cloned()
    }

    /// The eviction tombstones (inverted signatures), oldest first.
    pub fn deleted_signatures(&self) -> Vec<Signature> {
        self.inner.read().unwrap().deleted_order.iter().copied().collect()
    }

    /// True when the inverted form of `sig` is tombstoned.
    pub fn is_tombstoned(&self, sig: &Signature) -> bool {
        self.inner.read().unwrap().deleted.contains(&sig.inverted())
    }

    /// Age of the oldest retained message at `now_ms`, if any.
    pub fn oldest_age_secs(&self, now_ms: u64) -> Option<u32> {
        let inner = self.inner.read().unwrap();
        inner.messages.front().map(|m| m.age_secs(now_ms))
    }

    /// Origination estimate of the newest retained message.
    pub fn newest_timestamp_ms(&self) -> Option<i64> {
        let inner = self.inner.read().unwrap();
        inner.messages.back().map(|m| m.timestamp_ms())
    }
}

fn record_tombstone(inner: &mut StoreInner, inverted: Signature, max_deleted: usize) {
    if inner.deleted.insert(inverted) {
        inner.deleted_order.push_back(inverted);
        while inner.deleted_order.len() > max_deleted {
            if let Some(old) = inner.deleted_order.pop_front() {
                inner.deleted.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{Contact, Keypair, MessageId, MessageKind, Node, NodeUid};

    fn test_node() -> Arc<Node> {
        Arc::new(Node::new(
            Contact::from_address("10.0.0.1:6881"),
            NodeUid::random(),
            None,
        ))
    }

    fn message(node: &Arc<Node>, age_secs: u32, now_ms: u64) -> Arc<Message> {
        let keypair = Keypair::generate();
        let id = MessageId::random();
        let sig = keypair.sign_message(&node.uid(), &id, b"m", None);
        Arc::new(
            Message::new(
                Arc::clone(node),
                id,
                b"m".to_vec(),
                None,
                sig,
                age_secs,
                Vec::new(),
                MessageKind::Normal,
                now_ms,
                1_000_000,
            )
            .unwrap(),
        )
    }

    fn small_store(max: usize) -> MessageStore {
        MessageStore::new(StoreConfig {
            max_messages: max,
            max_deleted: max,
            ..StoreConfig::default()
        })
    }

    #[test]
    fn test_age_ordered_insert() {
        let store = small_store(16);
        let node = test_node();
        for age in [50, 10, 30, 70, 0] {
            assert!(store.add(message(&node, age, 0), SourceKind::Incoming, 0).is_accepted());
        }
        let ages: Vec<u32> = store.messages().iter().map(|m| m.age_secs(0)).collect();
        assert_eq!(ages, vec![70, 50, 30, 10, 0]);
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let store = small_store(16);
        let node = test_node();
        let msg = message(&node, 0, 0);
        assert!(store.add(Arc::clone(&msg), SourceKind::Incoming, 0).is_accepted());
        assert_eq!(
            store.add(msg, SourceKind::Incoming, 0),
            AddOutcome::DuplicateSignature
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_eviction_records_tombstone_and_blocks_replay() {
        let store = small_store(2);
        let node = test_node();
        let oldest = message(&node, 100, 0);
        assert!(store.add(Arc::clone(&oldest), SourceKind::Incoming, 0).is_accepted());
        assert!(store.add(message(&node, 50, 0), SourceKind::Incoming, 0).is_accepted());
        assert!(store.add(message(&node, 10, 0), SourceKind::Incoming, 0).is_accepted());

        assert_eq!(store.len(), 2);
        assert!(store.is_tombstoned(oldest.signature()));
        assert_eq!(
            store.add(oldest, SourceKind::Incoming, 0),
            AddOutcome::Tombstoned
        );
    }

    #[test]
    fn test_insert_older_than_full_store_is_evicted_immediately() {
        let store = small_store(2);
        let node = test_node();
        assert!(store.add(message(&node, 20, 0), SourceKind::Incoming, 0).is_accepted());
        assert!(store.add(message(&node, 10, 0), SourceKind::Incoming, 0).is_accepted());

        let stale = message(&node, 500, 0);
        assert_eq!(
            store.add(Arc::clone(&stale), SourceKind::Incoming, 0),
            AddOutcome::EvictedImmediately
        );
        assert_eq!(store.len(), 2);
        // the tombstone still blocks a replay
        assert_eq!(
            store.add(stale, SourceKind::Incoming, 0),
            AddOutcome::Tombstoned
        );
    }

    #[test]
    fn test_new_counter_only_for_newer_half() {
        let store = small_store(16);
        let node = test_node();
        for age in [80, 60, 40, 20] {
            store.add(message(&node, age, 0), SourceKind::Incoming, 0);
        }
        let before = store.new_message_count();
        // lands at the back, past the midpoint
        store.add(message(&node, 0, 0), SourceKind::Incoming, 0);
        assert_eq!(store.new_message_count(), before + 1);
        // lands at the front, counter untouched
        store.add(message(&node, 200, 0), SourceKind::Incoming, 0);
        assert_eq!(store.new_message_count(), before + 1);
    }

    #[test]
    fn test_loading_never_counts_as_new() {
        let store = small_store(16);
        let node = test_node();
        for age in [30, 20, 10, 0] {
            store.add(message(&node, age, 0), SourceKind::Loading, 0);
        }
        assert_eq!(store.new_message_count(), 0);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_read_only_channel() {
        let owner = Keypair::generate();
        let store = MessageStore::new(StoreConfig {
            read_only_owner: Some(owner.public_key()),
            ..StoreConfig::default()
        });

        let stranger = test_node();
        assert_eq!(
            store.add(message(&stranger, 0, 0), SourceKind::Incoming, 0),
            AddOutcome::ReadOnly
        );

        let owned = Arc::new(Node::new(
            Contact::from_address("10.0.0.2:6881"),
            NodeUid::random(),
            Some(owner.public_key()),
        ));
        assert!(store.add(message(&owned, 0, 0), SourceKind::Incoming, 0).is_accepted());

        // control messages pass regardless of originator
        let keypair = Keypair::generate();
        let id = MessageId::random();
        let sig = keypair.sign_message(&stranger.uid(), &id, b"", Some(b"ctl"));
        let control = Arc::new(
            Message::new(
                Arc::clone(&stranger),
                id,
                Vec::new(),
                Some(b"ctl".to_vec()),
                sig,
                0,
                Vec::new(),
                MessageKind::Normal,
                0,
                0,
            )
            .unwrap(),
        );
        assert!(store.add(control, SourceKind::Incoming, 0).is_accepted());
    }

    #[test]
    fn test_mutation_count_tracks_changes() {
        let store = small_store(2);
        let node = test_node();
        assert_eq!(store.mutation_count(), 0);
        store.add(message(&node, 10, 0), SourceKind::Incoming, 0);
        assert_eq!(store.mutation_count(), 1);
        let dup = message(&node, 5, 0);
        store.add(Arc::clone(&dup), SourceKind::Incoming, 0);
        store.add(dup, SourceKind::Incoming, 0);
        // the duplicate did not mutate
        assert_eq!(store.mutation_count(), 2);
    }

    #[test]
    fn test_deleted_set_is_bounded() {
        let store = MessageStore::new(StoreConfig {
            max_messages: 1,
            max_deleted: 3,
            ..StoreConfig::default()
        });
        let node = test_node();
        for i in 0..10u32 {
            store.add(message(&node, 100 - i, 0), SourceKind::Incoming, 0);
        }
        assert!(store.deleted_signatures().len() <= 3);
    }

    #[test]
    fn test_oldest_age_tracks_front() {
        let store = small_store(8);
        let node = test_node();
        assert_eq!(store.oldest_age_secs(0), None);
        store.add(message(&node, 10, 0), SourceKind::Incoming, 0);
        store.add(message(&node, 90, 0), SourceKind::Incoming, 0);
        assert_eq!(store.oldest_age_secs(0), Some(90));
        assert_eq!(store.oldest_age_secs(5_000), Some(95));
    }
}
