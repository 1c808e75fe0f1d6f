//! Reconciliation snapshots: the masked bloom summary of local state.
//!
//! A snapshot freezes "what I hold" at one mutation count: masked keys for
//! every live signature, every eviction tombstone, and every keyed node.
//! The mask is fresh per build so a filter from one exchange tells an
//! observer nothing about another. A key collision after masking would
//! make two distinct messages indistinguishable, so the build retries with
//! a new mask until the masked key set is collision-free.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, warn};

use meshsync_core::{limits, BloomFilter, NodeUid, PublicKey};
use meshsync_store::{MessageStore, NodeRegistry};

use crate::wire::SyncRequest;

/// Mask attempts before giving up on a collision-free build.
const MAX_MASK_ATTEMPTS: usize = 64;

/// Filter bits allocated per key; ~1% false positives.
const BITS_PER_KEY: usize = 10;

/// XOR the 8-byte exchange mask into the head of a filter key.
pub fn mask_key(bytes: &[u8], mask: &[u8; 8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    for (i, b) in mask.iter().enumerate().take(out.len()) {
        out[i] ^= b;
    }
    out
}

/// The filter key advertising a keyed node: `pubkey || address`.
pub fn node_key(public_key: &PublicKey, address: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + address.len());
    out.extend_from_slice(public_key.as_bytes());
    out.extend_from_slice(address.as_bytes());
    out
}

/// A frozen, masked summary of local state for one or more exchanges.
#[derive(Debug)]
pub struct ReconSnapshot {
    /// The exchange mask for this snapshot's filter.
    pub mask: [u8; 8],
    /// Masked membership filter.
    pub bloom: BloomFilter,
    /// Live message count at build time.
    pub message_count: usize,
    /// New-message counter at build time.
    pub new_message_count: u64,
    /// Oldest retained message age at build time.
    pub oldest_age_secs: Option<u32>,
    /// Unmasked `pubkey || address` keys advertised by this snapshot.
    /// Repliers add nodes discovered mid-extraction so later repliers
    /// against the same snapshot do not re-attach first-sight details.
    node_keys: HashSet<Vec<u8>>,
    degenerate: bool,
}

impl ReconSnapshot {
    /// Build a snapshot of the store and registry at `now_ms`.
    pub fn build(store: &MessageStore, registry: &NodeRegistry, now_ms: u64) -> Self {
        let mut live_keys: Vec<Vec<u8>> = Vec::new();
        for message in store.messages() {
            if message.is_local_notice() {
                continue;
            }
            live_keys.push(message.signature().as_bytes().to_vec());
        }
        let deleted_keys: Vec<Vec<u8>> = store
            .deleted_signatures()
            .iter()
            .map(|sig| sig.as_bytes().to_vec())
            .collect();

        let mut node_keys: HashSet<Vec<u8>> = HashSet::new();
        for node in registry.all() {
            if let Some(key) = node.public_key() {
                node_keys.insert(node_key(&key, &node.address()));
            }
        }

        let total = live_keys.len() + deleted_keys.len() + node_keys.len();
        let message_count = live_keys.len();
        let new_message_count = store.new_message_count();
        let oldest_age_secs = store.oldest_age_secs(now_ms);

        let mut rng = rand::thread_rng();
        for attempt in 0..MAX_MASK_ATTEMPTS {
            let mask: [u8; 8] = rng.gen();
            let nbits =
                (total * BITS_PER_KEY + rng.gen_range(0..16)).max(limits::MIN_BLOOM_BITS);

            let mut masked: HashSet<Vec<u8>> = HashSet::with_capacity(total);
            let mut collided = false;
            for key in live_keys
                .iter()
                .chain(deleted_keys.iter())
                .chain(node_keys.iter())
            {
                if !masked.insert(mask_key(key, &mask)) {
                    collided = true;
                    break;
                }
            }
            if collided {
                continue;
            }

            let mut bloom = BloomFilter::new(nbits);
            for key in &masked {
                bloom.add(key);
            }
            if attempt > 0 {
                debug!(attempt, "snapshot mask retried after collision");
            }
            return Self {
                mask,
                bloom,
                message_count,
                new_message_count,
                oldest_age_secs,
                node_keys,
                degenerate: false,
            };
        }

        warn!("no collision-free mask found; snapshot degenerate, sync round skipped");
        Self {
            mask: [0; 8],
            bloom: BloomFilter::empty(),
            message_count,
            new_message_count,
            oldest_age_secs,
            node_keys,
            degenerate: true,
        }
    }

    /// True when no collision-free mask was found. The filter is empty and
    /// the snapshot must not drive an exchange.
    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// True when this snapshot already advertises the node key.
    pub fn has_node_key(&self, key: &[u8]) -> bool {
        self.node_keys.contains(key)
    }

    /// Record a node discovered while extracting a reply.
    pub fn note_node_key(&mut self, key: Vec<u8>) {
        self.node_keys.insert(key);
    }

    /// Assemble the sync request this snapshot advertises.
    pub fn make_request(
        &self,
        uid: NodeUid,
        rendezvous: Option<meshsync_core::Contact>,
    ) -> SyncRequest {
        SyncRequest {
            version: meshsync_core::PROTOCOL_VERSION,
            uid,
            request_id: rand::thread_rng().gen(),
            mask: self.mask,
            bloom: self.bloom.clone(),
            message_count: self.message_count as u32,
            new_message_count: self.new_message_count as u32,
            oldest_age_secs: self.oldest_age_secs,
            rendezvous,
        }
    }
}

struct CachedSnapshot {
    snapshot: Arc<Mutex<ReconSnapshot>>,
    built_at_ms: u64,
    mutation_count: u64,
}

/// Cache that reuses a snapshot while the store is unchanged and the
/// snapshot is younger than the validity window.
pub struct SnapshotCache {
    validity_ms: u64,
    inner: Mutex<Option<CachedSnapshot>>,
}

impl SnapshotCache {
    /// Default validity window, milliseconds.
    pub const DEFAULT_VALIDITY_MS: u64 = 30_000;

    /// Create a cache with the given validity window.
    pub fn new(validity_ms: u64) -> Self {
        Self {
            validity_ms,
            inner: Mutex::new(None),
        }
    }

    /// Current snapshot, rebuilding when stale.
    pub fn get(
        &self,
        store: &MessageStore,
        registry: &NodeRegistry,
        now_ms: u64,
    ) -> Arc<Mutex<ReconSnapshot>> {
        let mut inner = self.inner.lock().unwrap();
        let mutation = store.mutation_count();
        if let Some(cached) = inner.as_ref() {
            if cached.mutation_count == mutation
                && now_ms.saturating_sub(cached.built_at_ms) < self.validity_ms
            {
                return Arc::clone(&cached.snapshot);
            }
        }
        let snapshot = Arc::new(Mutex::new(ReconSnapshot::build(store, registry, now_ms)));
        *inner = Some(CachedSnapshot {
            snapshot: Arc::clone(&snapshot),
            built_at_ms: now_ms,
            mutation_count: mutation,
        });
        snapshot
    }

    /// Drop the cached snapshot.
    pub fn invalidate(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VALIDITY_MS)
    }
}
