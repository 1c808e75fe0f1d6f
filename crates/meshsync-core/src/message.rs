//! The signed message record and provenance history helpers.
//!
//! A message is immutable once accepted; only its delivery/seen counters
//! and local annotation change afterwards. Ages are self-reported seconds
//! relative to receipt, re-derived against a caller-supplied monotonic
//! clock so ordering logic stays deterministic under test.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::crypto::Signature;
use crate::error::CoreError;
use crate::node::Node;
use crate::types::{limits, HopId, MessageId};

/// How a message reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Composed by the local user.
    Local,
    /// Accepted from a peer during reconciliation.
    Incoming,
    /// Restored from persisted state.
    Loading,
}

/// Message class. Local variants are synthesized for the user and never
/// offered to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Ordinary signed channel message.
    Normal,
    /// Local informational notice.
    LocalInfo,
    /// Local error notice.
    LocalError,
}

/// A signed, immutable channel message.
#[derive(Debug)]
pub struct Message {
    node: Arc<Node>,
    id: MessageId,
    content: Vec<u8>,
    control: Option<Vec<u8>>,
    signature: Signature,
    kind: MessageKind,
    /// Provenance chain: newest hop first, 4 bytes per hop.
    history: Vec<u8>,
    /// Self-reported age at the moment of receipt.
    age_at_receipt_secs: u32,
    /// Monotonic receipt time.
    received_ms: u64,
    /// Wall-clock origination estimate (receipt wall time minus age).
    timestamp_ms: i64,
    delivered: AtomicU32,
    seen: AtomicU32,
    probably_seen: AtomicU32,
    local_annotation: Mutex<Option<String>>,
}

impl Message {
    /// Assemble a message record.
    ///
    /// `now_ms` is the monotonic receipt time; `wall_ms` the wall clock at
    /// receipt, used to estimate the origination timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Arc<Node>,
        id: MessageId,
        content: Vec<u8>,
        control: Option<Vec<u8>>,
        signature: Signature,
        age_secs: u32,
        history: Vec<u8>,
        kind: MessageKind,
        now_ms: u64,
        wall_ms: i64,
    ) -> Result<Self, CoreError> {
        if content.len() > limits::MAX_MESSAGE_SIZE {
            return Err(CoreError::ContentTooLarge {
                size: content.len(),
                max: limits::MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            node,
            id,
            content,
            control,
            signature,
            kind,
            history,
            age_at_receipt_secs: age_secs,
            received_ms: now_ms,
            timestamp_ms: wall_ms - i64::from(age_secs) * 1000,
            delivered: AtomicU32::new(0),
            seen: AtomicU32::new(0),
            probably_seen: AtomicU32::new(0),
            local_annotation: Mutex::new(None),
        })
    }

    /// The originating node.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The 8-byte message id.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Message content bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Opaque control payload, if any.
    pub fn control(&self) -> Option<&[u8]> {
        self.control.as_deref()
    }

    /// The signature over `(uid, id, content, control?)`.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Message class.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// True for locally synthesized info/error notices.
    pub fn is_local_notice(&self) -> bool {
        self.kind != MessageKind::Normal
    }

    /// Raw provenance chain, newest hop first.
    pub fn history(&self) -> &[u8] {
        &self.history
    }

    /// Self-reported age at receipt, in seconds.
    pub fn age_at_receipt_secs(&self) -> u32 {
        self.age_at_receipt_secs
    }

    /// Current age in seconds at monotonic time `now_ms`.
    pub fn age_secs(&self, now_ms: u64) -> u32 {
        let elapsed = now_ms.saturating_sub(self.received_ms) / 1000;
        self.age_at_receipt_secs
            .saturating_add(u32::try_from(elapsed).unwrap_or(u32::MAX))
    }

    /// Wall-clock origination estimate in ms.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Times this message was handed to a peer in a sync reply.
    pub fn delivery_count(&self) -> u32 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Record a delivery.
    pub fn mark_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Times a peer has definitively confirmed holding this message.
    pub fn seen_count(&self) -> u32 {
        self.seen.load(Ordering::Relaxed)
    }

    /// Record a definitive confirmation.
    pub fn mark_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Times a peer's filter matched this message (subject to false positives).
    pub fn probably_seen_count(&self) -> u32 {
        self.probably_seen.load(Ordering::Relaxed)
    }

    /// Record a probable sighting.
    pub fn mark_probably_seen(&self) {
        self.probably_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Local-only annotation; never broadcast.
    pub fn local_annotation(&self) -> Option<String> {
        self.local_annotation.lock().unwrap().clone()
    }

    /// Attach a local-only annotation.
    pub fn set_local_annotation(&self, text: impl Into<String>) {
        *self.local_annotation.lock().unwrap() = Some(text.into());
    }
}

/// Prepend a relay hop to a provenance chain, dropping the oldest hops
/// past the cap.
pub fn extend_history(history: &[u8], hop: HopId) -> Vec<u8> {
    let keep = history.len().min(limits::MAX_HISTORY_LEN - 4);
    let mut out = Vec::with_capacity(keep + 4);
    out.extend_from_slice(hop.as_bytes());
    out.extend_from_slice(&history[..keep]);
    out
}

/// Iterate the hop fingerprints of a chain, newest first.
///
/// Trailing bytes that do not form a whole hop are ignored, matching the
/// wire tolerance for truncated chains.
pub fn history_hops(history: &[u8]) -> impl Iterator<Item = HopId> + '_ {
    let whole = history.len() & !3;
    history[..whole]
        .chunks_exact(4)
        .map(|chunk| HopId::from_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
