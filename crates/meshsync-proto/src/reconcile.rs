//! Set reconciliation: answering a peer's filter with what it is missing,
//! and folding a peer's reply into local state.
//!
//! Membership tests run against the requester's masked filter, so every
//! verdict is probabilistic on their side: "probably seen" may be a false
//! positive, which is why delivery counters distinguish probable from
//! confirmed sightings.

use std::sync::Arc;

use tracing::{debug, warn};

use meshsync_core::{
    extend_history, limits, Contact, HopId, Message, MessageKind, Node, NodeUid, PublicKey,
    SourceKind,
};
use meshsync_store::{AddOutcome, MessageStore, NodeRegistry};

use crate::flood::HistoryDefense;
use crate::snapshot::{mask_key, node_key, ReconSnapshot};
use crate::wire::{SyncReply, SyncRequest, SyncStatus, WireMessageEntry};

/// Reconciliation tuning.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// A message this much older than the peer's oldest is not offered.
    pub too_old_band_secs: u32,
    /// Content+control byte budget across one reply.
    pub reply_budget: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            too_old_band_secs: 300,
            reply_budget: limits::MAX_REPLY_BYTES,
        }
    }
}

/// Result of building a reply.
#[derive(Debug)]
pub struct ReplyOutcome {
    /// The reply to send back.
    pub reply: SyncReply,
    /// The requester appears to hold more messages than we do; a
    /// candidate for the inbound bias slot.
    pub peer_holds_more: bool,
}

/// Build the reply to a sync request.
///
/// The caller holds the snapshot lock for the duration, so concurrent
/// repliers observe a consistent node map; nodes whose details we attach
/// here are recorded into the snapshot.
pub fn compute_reply(
    store: &MessageStore,
    snapshot: &mut ReconSnapshot,
    request: &SyncRequest,
    config: &ReconcileConfig,
    local_uid: NodeUid,
    peer_hint: Option<(NodeUid, Contact)>,
    banned: impl Fn(&Message) -> bool,
    now_ms: u64,
) -> ReplyOutcome {
    let mut entries: Vec<WireMessageEntry> = Vec::new();
    let mut matched: Vec<Arc<Message>> = Vec::new();
    let mut they_deleted = 0usize;
    let mut more = 0u32;
    let mut spent = 0usize;
    let mut local_count = 0usize;

    for message in store.messages() {
        if message.is_local_notice() {
            continue;
        }
        local_count += 1;

        let sig = message.signature();
        if request
            .bloom
            .contains(&mask_key(sig.as_bytes(), &request.mask))
        {
            message.mark_probably_seen();
            matched.push(message);
            continue;
        }
        if request
            .bloom
            .contains(&mask_key(sig.inverted().as_bytes(), &request.mask))
        {
            they_deleted += 1;
            continue;
        }

        // missing on their side
        if banned(&message) {
            // never forward, but stop it being offered to us again
            message.mark_seen();
            message.mark_delivered();
            continue;
        }
        let age = message.age_secs(now_ms);
        if let Some(peer_oldest) = request.oldest_age_secs {
            if age.saturating_sub(peer_oldest) >= config.too_old_band_secs {
                continue;
            }
        }

        let cost = message.content().len() + message.control().map_or(0, <[u8]>::len);
        if spent + cost > config.reply_budget {
            more += 1;
            continue;
        }
        spent += cost;

        let node = message.node();
        let mut public_key = None;
        let mut contact = None;
        if let Some(key) = node.public_key() {
            let nk = node_key(&key, &node.address());
            if !request.bloom.contains(&mask_key(&nk, &request.mask)) {
                public_key = Some(key);
                contact = Some(node.contact());
                snapshot.note_node_key(nk);
            }
        }

        message.mark_delivered();
        entries.push(WireMessageEntry {
            uid: node.uid(),
            id: message.id(),
            content: message.content().to_vec(),
            control: message.control().map(<[u8]>::to_vec),
            signature: *sig,
            age_secs: age,
            history: message.history().to_vec(),
            public_key,
            contact,
        });
    }

    // With no deletion evidence and a peer at least as full as us, every
    // filter match is almost certainly a real sighting.
    if they_deleted == 0 && request.message_count as usize >= local_count {
        for message in &matched {
            message.mark_seen();
        }
    }

    debug!(
        sent = entries.len(),
        more,
        matched = matched.len(),
        they_deleted,
        "sync reply computed"
    );

    ReplyOutcome {
        reply: SyncReply {
            status: SyncStatus::Ok,
            uid: local_uid,
            messages: entries,
            more,
            peer_hint,
        },
        peer_holds_more: request.message_count as usize > local_count,
    }
}

/// Context for folding received messages into local state.
pub struct ApplyContext<'a> {
    /// Message store.
    pub store: &'a MessageStore,
    /// Node registry.
    pub registry: &'a NodeRegistry,
    /// Chain watch machinery.
    pub defense: &'a HistoryDefense,
    /// The peer these entries arrived from.
    pub relay: &'a Arc<Node>,
    /// Record provenance hops; enabled once the channel is busy.
    pub busy: bool,
    /// Our own identity, for recognizing echoes of our messages.
    pub local_key: Option<PublicKey>,
}

/// Result of folding a batch of received messages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Entries whose signature verified.
    pub received: usize,
    /// Entries newly retained in the store.
    pub accepted: usize,
    /// Echoes of our own messages, marked delivered.
    pub own_echoes: usize,
}

/// Verify and store messages carried by a sync reply.
pub fn apply_entries(
    ctx: &ApplyContext<'_>,
    entries: &[WireMessageEntry],
    now_ms: u64,
    wall_ms: i64,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    let relay_hop = HopId::from_address(&ctx.relay.address());

    for entry in entries {
        let Some(verified_key) = verify_entry(ctx.registry, entry) else {
            warn!(uid = ?entry.uid, "received message failed signature verification");
            continue;
        };
        outcome.received += 1;

        if !ctx.defense.record_chain(&entry.history, now_ms) {
            debug!(uid = ?entry.uid, "dropped message with banned provenance");
            continue;
        }

        if ctx.local_key == Some(verified_key) {
            // our own message coming back around
            if let Some(existing) = ctx.store.get_by_signature(&entry.signature) {
                existing.mark_delivered();
                existing.mark_seen();
                outcome.own_echoes += 1;
                continue;
            }
        }

        let contact = entry
            .contact
            .clone()
            .unwrap_or_else(|| ctx.relay.contact());
        let node = ctx
            .registry
            .resolve(contact, entry.uid, Some(verified_key));

        let history = if ctx.busy {
            extend_history(&entry.history, relay_hop)
        } else {
            entry.history.clone()
        };

        let message = match Message::new(
            Arc::clone(&node),
            entry.id,
            entry.content.clone(),
            entry.control.clone(),
            entry.signature,
            entry.age_secs,
            history,
            MessageKind::Normal,
            now_ms,
            wall_ms,
        ) {
            Ok(message) => Arc::new(message),
            Err(err) => {
                warn!(uid = ?entry.uid, %err, "received message rejected");
                continue;
            }
        };
        let timestamp_ms = message.timestamp_ms();

        match ctx.store.add(message, SourceKind::Incoming, now_ms) {
            AddOutcome::Accepted => {
                outcome.accepted += 1;
                // a fresher contact rides in with a newer message
                if let Some(contact) = &entry.contact {
                    if timestamp_ms > node.latest_message_ms() {
                        node.update_contact(contact.clone(), timestamp_ms);
                    }
                }
            }
            AddOutcome::DuplicateSignature
            | AddOutcome::Tombstoned
            | AddOutcome::ReadOnly
            | AddOutcome::EvictedImmediately => {}
        }
    }

    outcome
}

fn verify_entry(registry: &NodeRegistry, entry: &WireMessageEntry) -> Option<PublicKey> {
    let verify = |key: &PublicKey| {
        key.verify_message(
            &entry.uid,
            &entry.id,
            &entry.content,
            entry.control.as_deref(),
            &entry.signature,
        )
        .is_ok()
    };

    // nodes already known under the claimed uid first
    for node in registry.nodes_for(&entry.uid) {
        if let Some(key) = node.public_key() {
            if verify(&key) {
                return Some(key);
            }
        }
    }
    // then every key we know at all (identity republished under a new uid)
    for node in registry.all() {
        if let Some(key) = node.public_key() {
            if verify(&key) {
                return Some(key);
            }
        }
    }
    // finally the first-sight key carried by the entry itself
    if let Some(key) = entry.public_key {
        if verify(&key) {
            return Some(key);
        }
    }
    None
}
