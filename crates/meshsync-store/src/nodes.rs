//! Node registry: uid-indexed peer records with bounded pruning.
//!
//! Several distinct nodes can share a uid (an identity republished from a
//! new address), so the index is a multimap. Structural changes go through
//! the registry; per-node mutable state lives inside [`Node`] itself.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::seq::SliceRandom;
use tracing::debug;

use meshsync_core::{limits, Contact, Node, NodeUid, PublicKey};

/// Aggregate node counts for the observable counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeCounts {
    /// All registered nodes.
    pub total: usize,
    /// Nodes with a recent successful exchange and no failures.
    pub live: usize,
    /// Nodes with at least one consecutive failure.
    pub failing: usize,
}

struct RegistryInner {
    by_uid: HashMap<NodeUid, Vec<Arc<Node>>>,
    /// Nodes demoted after a loopback discovery; consulted by `resolve`
    /// so a self-referencing contact is never re-registered.
    loopbacks: HashMap<NodeUid, Arc<Node>>,
    total: usize,
}

/// Uid-indexed peer registry.
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                by_uid: HashMap::new(),
                loopbacks: HashMap::new(),
                total: 0,
            }),
        }
    }

    /// Find or create the node for `(contact, uid)`, attaching `public_key`
    /// when supplied.
    ///
    /// A keyless node that would acquire a conflicting key is replaced by a
    /// fresh record; key identity is authoritative.
    pub fn resolve(
        &self,
        contact: Contact,
        uid: NodeUid,
        public_key: Option<PublicKey>,
    ) -> Arc<Node> {
        let mut inner = self.inner.write().unwrap();

        if let Some(loopback) = inner.loopbacks.get(&uid) {
            if loopback.address() == contact.address {
                return Arc::clone(loopback);
            }
        }

        let entries = inner.by_uid.entry(uid).or_default();

        let found = match public_key {
            Some(key) => entries
                .iter()
                .position(|n| n.public_key() == Some(key))
                .or_else(|| entries.iter().position(|n| n.address() == contact.address)),
            None => entries.iter().position(|n| n.address() == contact.address),
        };

        if let Some(idx) = found {
            let node = Arc::clone(&entries[idx]);
            if let Some(key) = public_key {
                if node.set_key_details(contact.clone(), key) {
                    return node;
                }
                // conflicting key: discard the old record for this slot
                let fresh = Arc::new(Node::new(contact, uid, Some(key)));
                entries[idx] = Arc::clone(&fresh);
                debug!(uid = ?uid, "replaced node with conflicting identity key");
                return fresh;
            }
            return node;
        }

        let node = Arc::new(Node::new(contact, uid, public_key));
        entries.push(Arc::clone(&node));
        inner.total += 1;
        node
    }

    /// All registered nodes.
    pub fn all(&self) -> Vec<Arc<Node>> {
        let inner = self.inner.read().unwrap();
        inner.by_uid.values().flatten().cloned().collect()
    }

    /// Nodes registered under `uid`.
    pub fn nodes_for(&self, uid: &NodeUid) -> Vec<Arc<Node>> {
        let inner = self.inner.read().unwrap();
        inner.by_uid.get(uid).cloned().unwrap_or_default()
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().total
    }

    /// True when no nodes are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counts for the observable counters.
    pub fn counts(&self) -> NodeCounts {
        let inner = self.inner.read().unwrap();
        let mut counts = NodeCounts::default();
        for node in inner.by_uid.values().flatten() {
            counts.total += 1;
            if node.fail_count() > 0 {
                counts.failing += 1;
            } else if node.is_live() {
                counts.live += 1;
            }
        }
        counts
    }

    /// Remove a node. With `to_loopback` the record is demoted into the
    /// loopback map so `resolve` never resurrects it.
    pub fn remove(&self, node: &Arc<Node>, to_loopback: bool) {
        let mut inner = self.inner.write().unwrap();
        remove_locked(&mut inner, node);
        if to_loopback {
            inner.loopbacks.insert(node.uid(), Arc::clone(node));
        }
    }

    /// A random live node, falling back to a random not-failed node.
    /// Offered to sync requesters as a peer hint.
    pub fn random_liveish(&self) -> Option<Arc<Node>> {
        let all = self.all();
        let mut rng = rand::thread_rng();
        let live: Vec<&Arc<Node>> = all.iter().filter(|n| n.is_live()).collect();
        if let Some(node) = live.choose(&mut rng) {
            return Some(Arc::clone(node));
        }
        let not_failed: Vec<&Arc<Node>> = all.iter().filter(|n| n.fail_count() == 0).collect();
        not_failed.choose(&mut rng).map(|n| Arc::clone(n))
    }

    /// Periodic pruning.
    ///
    /// Nodes failing more than once are removed outright; past capacity the
    /// remainder is trimmed preferring failing, then never-succeeded, then
    /// shuffled live nodes. The registry never shrinks below the minimum
    /// floor, and `exempt` nodes are never touched.
    pub fn prune(&self, exempt: &[Arc<Node>]) -> usize {
        let mut inner = self.inner.write().unwrap();
        let is_exempt =
            |node: &Arc<Node>| exempt.iter().any(|e| Arc::ptr_eq(e, node));

        let mut removed = 0;

        let failing: Vec<Arc<Node>> = inner
            .by_uid
            .values()
            .flatten()
            .filter(|n| n.fail_count() > 1 && !is_exempt(n))
            .cloned()
            .collect();
        for node in failing {
            if inner.total <= limits::MIN_NODES {
                break;
            }
            remove_locked(&mut inner, &node);
            removed += 1;
        }

        if inner.total > limits::MAX_NODES {
            let mut failing = Vec::new();
            let mut marginal = Vec::new();
            let mut live = Vec::new();
            for node in inner.by_uid.values().flatten() {
                if is_exempt(node) {
                    continue;
                }
                if node.fail_count() > 0 {
                    failing.push(Arc::clone(node));
                } else if node.last_alive_ms() == 0 {
                    marginal.push(Arc::clone(node));
                } else {
                    live.push(Arc::clone(node));
                }
            }
            live.shuffle(&mut rand::thread_rng());

            let mut victims = failing;
            victims.extend(marginal);
            victims.extend(live);
            for node in victims {
                if inner.total <= limits::MAX_NODES || inner.total <= limits::MIN_NODES {
                    break;
                }
                remove_locked(&mut inner, &node);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, remaining = inner.total, "pruned node registry");
        }
        removed
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_locked(inner: &mut RegistryInner, node: &Arc<Node>) {
    if let Some(entries) = inner.by_uid.get_mut(&node.uid()) {
        let before = entries.len();
        entries.retain(|n| !Arc::ptr_eq(n, node));
        let dropped = before - entries.len();
        inner.total -= dropped;
        if entries.is_empty() {
            inner.by_uid.remove(&node.uid());
        }
    }
}
