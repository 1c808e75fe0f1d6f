//! Peer selection for outbound sync rounds.
//!
//! Each timer tick picks at most one peer, cascading through: a biased
//! outbound node (a responder that told us it holds more), a biased
//! inbound node (a requester that appears ahead of us), a prefer-live
//! pick after local activity, a forced not-failed pick when too many
//! active syncs are failing, and finally a uniform pick. Bias slots are
//! flood-resistant: an address can claim one at most once per window.

use std::sync::{Arc, Mutex};

use rand::seq::SliceRandom;
use tracing::debug;

use meshsync_core::{limits, CountingBloomFilter, Node};

/// Selector tuning.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Concurrent outbound syncs.
    pub max_concurrent: usize,
    /// Active failing syncs before selection is restricted to not-failed
    /// peers.
    pub max_failing: usize,
    /// Messages a biased-outbound responder must have actually delivered.
    pub min_received_for_bias: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: limits::MAX_CONC_SYNC,
            max_failing: limits::MAX_FAIL_SYNC,
            min_received_for_bias: 2,
        }
    }
}

struct SelectorInner {
    /// Active outbound syncs: the node and the address it was reached at.
    active: Vec<(Arc<Node>, String)>,
    biased_out: Option<Arc<Node>>,
    biased_in: Option<Arc<Node>>,
    /// Addresses that already claimed a bias slot this window.
    bias_claims: CountingBloomFilter,
    prefer_live: bool,
}

/// Tick-driven peer selector with bias hints.
pub struct PeerSelector {
    config: SelectorConfig,
    inner: Mutex<SelectorInner>,
}

impl PeerSelector {
    /// Create a selector.
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SelectorInner {
                active: Vec::new(),
                biased_out: None,
                biased_in: None,
                bias_claims: CountingBloomFilter::new(1024),
                prefer_live: true,
            }),
        }
    }

    /// Ask the next selection to prefer a live peer. Set after local
    /// sends, so fresh messages spread promptly.
    pub fn request_prefer_live(&self) {
        self.inner.lock().unwrap().prefer_live = true;
    }

    /// Record the outcome of an outbound sync. A responder reporting a
    /// backlog, after actually delivering messages, earns the outbound
    /// bias slot.
    pub fn note_reply(&self, node: &Arc<Node>, more: u32, received: usize) {
        if more == 0 || received < self.config.min_received_for_bias {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if claim(&mut inner.bias_claims, &node.address()) {
            debug!(node = ?node.uid(), more, "biasing next sync toward backlog holder");
            inner.biased_out = Some(Arc::clone(node));
        }
    }

    /// Record an inbound request. A requester that apparently holds more
    /// than us earns the inbound bias slot.
    pub fn note_request_from(&self, node: &Arc<Node>, peer_count: u32, local_count: u32) {
        if peer_count <= local_count {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if claim(&mut inner.bias_claims, &node.address()) {
            debug!(node = ?node.uid(), "biasing next sync toward ahead requester");
            inner.biased_in = Some(Arc::clone(node));
        }
    }

    /// Clear the per-window bias claims. Called every minute.
    pub fn clear_bias_claims(&self) {
        self.inner.lock().unwrap().bias_claims.clear();
    }

    /// Pick the next sync target from `candidates`. Consumes at most one
    /// bias slot; never picks a peer that already has an active sync.
    pub fn select(&self, candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(node) = inner.biased_out.take() {
            if node.is_live() && !is_active(&inner.active, &node) {
                return Some(node);
            }
        }
        if let Some(node) = inner.biased_in.take() {
            if node.fail_count() == 0 && !is_active(&inner.active, &node) {
                return Some(node);
            }
        }

        let available: Vec<&Arc<Node>> = candidates
            .iter()
            .filter(|n| !is_active(&inner.active, n))
            .collect();
        if available.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();

        if inner.prefer_live {
            let live: Vec<&Arc<Node>> =
                available.iter().copied().filter(|n| n.is_live()).collect();
            if let Some(node) = pick_by_identity(&live, &mut rng) {
                inner.prefer_live = false;
                return Some(node);
            }
        }

        let failing_active = inner
            .active
            .iter()
            .filter(|(n, _)| n.fail_count() > 0)
            .count();
        if failing_active >= self.config.max_failing {
            let not_failed: Vec<&Arc<Node>> = available
                .iter()
                .copied()
                .filter(|n| n.fail_count() == 0)
                .collect();
            if let Some(node) = pick_by_identity(&not_failed, &mut rng) {
                return Some(node);
            }
        }

        pick_by_identity(&available, &mut rng)
    }

    /// Claim an active-sync slot for `node`. False when the pool is full
    /// or the peer (by record or address) is already syncing.
    pub fn begin(&self, node: &Arc<Node>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.len() >= self.config.max_concurrent {
            return false;
        }
        if is_active(&inner.active, node) {
            return false;
        }
        let address = node.address();
        inner.active.push((Arc::clone(node), address));
        true
    }

    /// Release the active-sync slot. Always called on completion, error
    /// included.
    pub fn end(&self, node: &Arc<Node>) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.retain(|(n, _)| !Arc::ptr_eq(n, node));
    }

    /// Currently active outbound syncs.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }
}

impl Default for PeerSelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

fn claim(claims: &mut CountingBloomFilter, address: &str) -> bool {
    if claims.count(address.as_bytes()) > 0 {
        return false;
    }
    claims.add(address.as_bytes());
    true
}

fn is_active(active: &[(Arc<Node>, String)], node: &Arc<Node>) -> bool {
    let address = node.address();
    active
        .iter()
        .any(|(n, a)| Arc::ptr_eq(n, node) || *a == address)
}

/// Uniform pick over distinct identities: addresses sharing one uid count
/// once, so a peer publishing many addresses gains no selection weight.
fn pick_by_identity(
    candidates: &[&Arc<Node>],
    rng: &mut impl rand::Rng,
) -> Option<Arc<Node>> {
    if candidates.is_empty() {
        return None;
    }
    let mut uids: Vec<meshsync_core::NodeUid> = candidates.iter().map(|n| n.uid()).collect();
    uids.sort();
    uids.dedup();
    let uid = *uids.choose(rng)?;
    let members: Vec<&&Arc<Node>> = candidates.iter().filter(|n| n.uid() == uid).collect();
    members.choose(rng).map(|n| Arc::clone(**n))
}

/// Sync cadence stretch for an idle channel: every tick under two minutes
/// since the last message, every second tick under five, every third
/// beyond that.
pub fn cadence_multiplier(idle_ms: u64) -> u32 {
    if idle_ms < 120_000 {
        1
    } else if idle_ms < 300_000 {
        2
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::{Contact, NodeUid};

    fn node(addr: &str) -> Arc<Node> {
        Arc::new(Node::new(
            Contact::from_address(addr),
            NodeUid::random(),
            None,
        ))
    }

    fn live_node(addr: &str) -> Arc<Node> {
        let n = node(addr);
        n.mark_ok(1_000);
        n
    }

    #[test]
    fn test_outbound_bias_wins_and_is_consumed() {
        let selector = PeerSelector::default();
        let favored = live_node("10.0.0.1:1");
        let other = live_node("10.0.0.2:1");
        selector.note_reply(&favored, 3, 2);

        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &favored));
        // consumed: next pick falls through to candidates
        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &other));
    }

    #[test]
    fn test_bias_requires_backlog_and_delivery() {
        let selector = PeerSelector::default();
        let other = live_node("10.0.0.9:1");
        let a = live_node("10.0.0.1:1");
        selector.note_reply(&a, 0, 5); // no backlog
        let b = live_node("10.0.0.2:1");
        selector.note_reply(&b, 3, 1); // too few received

        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &other));
    }

    #[test]
    fn test_dead_biased_node_skipped() {
        let selector = PeerSelector::default();
        let favored = live_node("10.0.0.1:1");
        selector.note_reply(&favored, 3, 2);
        favored.mark_failed();

        let fallback = live_node("10.0.0.2:1");
        let picked = selector.select(&[Arc::clone(&fallback)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &fallback));
    }

    #[test]
    fn test_inbound_bias() {
        let selector = PeerSelector::default();
        // drain the initial prefer-live flag
        let seed = live_node("10.0.9.9:1");
        selector.select(&[seed]);

        let requester = node("10.0.0.1:1");
        selector.note_request_from(&requester, 10, 4);
        let other = node("10.0.0.2:1");
        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &requester));

        // a requester with fewer messages earns nothing
        selector.note_request_from(&other, 3, 4);
        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &other));
    }

    #[test]
    fn test_address_claims_one_bias_per_window() {
        let selector = PeerSelector::default();
        let a = live_node("10.0.0.1:1");
        selector.note_reply(&a, 3, 2);
        selector.select(&[]); // consume
        selector.note_reply(&a, 3, 2); // same window: refused

        let other = live_node("10.0.0.2:1");
        let picked = selector.select(&[Arc::clone(&other)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &other));

        selector.clear_bias_claims();
        selector.note_reply(&a, 3, 2);
        let picked = selector.select(&[other]).unwrap();
        assert!(Arc::ptr_eq(&picked, &a));
    }

    #[test]
    fn test_prefer_live_consumed_once() {
        let selector = PeerSelector::default();
        let live = live_node("10.0.0.1:1");
        let cold = node("10.0.0.2:1");

        let picked = selector
            .select(&[Arc::clone(&cold), Arc::clone(&live)])
            .unwrap();
        assert!(Arc::ptr_eq(&picked, &live));

        // flag consumed; with only cold candidates we still pick one
        let picked = selector.select(&[Arc::clone(&cold)]).unwrap();
        assert!(Arc::ptr_eq(&picked, &cold));
    }

    #[test]
    fn test_begin_dedupes_node_and_address() {
        let selector = PeerSelector::default();
        let a = node("10.0.0.1:1");
        assert!(selector.begin(&a));
        assert!(!selector.begin(&a));
        // different record, same address
        let twin = node("10.0.0.1:1");
        assert!(!selector.begin(&twin));

        selector.end(&a);
        assert!(selector.begin(&twin));
    }

    #[test]
    fn test_begin_caps_concurrency() {
        let selector = PeerSelector::default();
        for i in 0..limits::MAX_CONC_SYNC {
            assert!(selector.begin(&node(&format!("10.0.0.{i}:1"))));
        }
        assert!(!selector.begin(&node("10.0.1.1:1")));
        assert_eq!(selector.active_count(), limits::MAX_CONC_SYNC);
    }

    #[test]
    fn test_active_peer_not_selected() {
        let selector = PeerSelector::default();
        let a = live_node("10.0.0.1:1");
        let b = live_node("10.0.0.2:1");
        assert!(selector.begin(&a));
        for _ in 0..20 {
            let picked = selector
                .select(&[Arc::clone(&a), Arc::clone(&b)])
                .unwrap();
            assert!(Arc::ptr_eq(&picked, &b));
        }
    }

    #[test]
    fn test_failing_actives_force_not_failed_pick() {
        let selector = PeerSelector::default();
        // drain prefer-live
        selector.select(&[live_node("10.9.9.9:1")]);

        for i in 0..2 {
            let failing = node(&format!("10.0.0.{i}:1"));
            failing.mark_failed();
            assert!(selector.begin(&failing));
        }
        let failed = node("10.0.1.1:1");
        failed.mark_failed();
        let healthy = node("10.0.1.2:1");
        for _ in 0..20 {
            let picked = selector
                .select(&[Arc::clone(&failed), Arc::clone(&healthy)])
                .unwrap();
            assert!(Arc::ptr_eq(&picked, &healthy));
        }
    }

    #[test]
    fn test_identity_weighting_counts_uid_once() {
        // one identity with many addresses, one with a single address
        let uid_many = NodeUid::random();
        let uid_one = NodeUid::random();
        let mut candidates = Vec::new();
        for i in 0..9 {
            candidates.push(Arc::new(Node::new(
                Contact::from_address(format!("10.0.0.{i}:1")),
                uid_many,
                None,
            )));
        }
        candidates.push(Arc::new(Node::new(
            Contact::from_address("10.0.1.1:1"),
            uid_one,
            None,
        )));

        let refs: Vec<&Arc<Node>> = candidates.iter().collect();
        let mut rng = rand::thread_rng();
        let mut single_hits = 0;
        for _ in 0..200 {
            let picked = pick_by_identity(&refs, &mut rng).unwrap();
            if picked.uid() == uid_one {
                single_hits += 1;
            }
        }
        // ~half the picks, not ~1 in 10
        assert!(single_hits > 50, "single_hits={single_hits}");
    }

    #[test]
    fn test_cadence_multiplier() {
        assert_eq!(cadence_multiplier(0), 1);
        assert_eq!(cadence_multiplier(119_999), 1);
        assert_eq!(cadence_multiplier(120_000), 2);
        assert_eq!(cadence_multiplier(299_999), 2);
        assert_eq!(cadence_multiplier(300_000), 3);
    }
}
