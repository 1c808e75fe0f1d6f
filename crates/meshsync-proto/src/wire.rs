//! Wire messages and the sealed envelope codec.
//!
//! Every payload on the wire is `seal(flag || body)` where `seal` is the
//! channel's authenticated cipher, `flag` marks optional gzip, and `body`
//! is canonical CBOR. Unknown enum tags and missing fields fail decoding
//! outright; a peer that cannot produce a well-formed envelope is treated
//! as a protocol failure, not accommodated.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use meshsync_channel::{ChannelSecret, HandshakeMessage};
use meshsync_core::{BloomFilter, Contact, MessageId, NodeUid, PublicKey, Signature};

use crate::error::{ProtoError, Result};

const FLAG_PLAIN: u8 = 0;
const FLAG_GZIP: u8 = 1;

/// Upper bound on a decompressed payload.
const MAX_DECODED_BYTES: usize = 256 * 1024;

/// How many recent inbound request ids we remember for duplicate drops.
const REQUEST_ID_HISTORY: usize = 64;

/// A sync request: "here is a summary of what I hold".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Protocol version of the sender.
    pub version: u8,
    /// Sender's node uid.
    pub uid: NodeUid,
    /// Random id; duplicates within the history window are dropped.
    pub request_id: u64,
    /// Mask XORed into every filter key for this exchange.
    pub mask: [u8; 8],
    /// Masked summary of held and deleted messages plus known nodes.
    pub bloom: BloomFilter,
    /// Live messages held by the sender.
    pub message_count: u32,
    /// Sender's new-message counter, for bias decisions.
    pub new_message_count: u32,
    /// Age of the sender's oldest retained message.
    pub oldest_age_secs: Option<u32>,
    /// Rendezvous contact when the sender is only reachable via a relay.
    pub rendezvous: Option<Contact>,
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Normal reply.
    Ok,
    /// The request reached its own sender; the caller should demote the
    /// contact it used.
    Loopback,
}

/// One message carried in a sync reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessageEntry {
    /// Originator's node uid.
    pub uid: NodeUid,
    /// Message id.
    pub id: MessageId,
    /// Content bytes.
    pub content: Vec<u8>,
    /// Control payload, if any.
    pub control: Option<Vec<u8>>,
    /// Signature over `(uid, id, content, control?)`.
    pub signature: Signature,
    /// Self-reported age in seconds.
    pub age_secs: u32,
    /// Provenance chain, newest hop first.
    pub history: Vec<u8>,
    /// Originator's identity key, attached on first sight only.
    pub public_key: Option<PublicKey>,
    /// Originator's contact, attached on first sight only.
    pub contact: Option<Contact>,
}

/// A sync reply: messages the requester appears to be missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReply {
    /// Reply status.
    pub status: SyncStatus,
    /// Responder's node uid.
    pub uid: NodeUid,
    /// Missing messages, oldest first, capped by the reply byte budget.
    pub messages: Vec<WireMessageEntry>,
    /// How many further messages the responder holds for us past the
    /// budget. Non-zero invites a follow-up sync.
    pub more: u32,
    /// A random liveish peer, to help sparse requesters find the swarm.
    pub peer_hint: Option<(NodeUid, Contact)>,
}

/// Top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Sync request.
    SyncRequest(SyncRequest),
    /// Sync reply.
    SyncReply(SyncReply),
    /// Key-exchange round for a private chat.
    Handshake(HandshakeMessage),
}

/// Encode, compress when it helps, and seal under the channel secret.
pub fn encode(message: &WireMessage, secret: &ChannelSecret) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(message, &mut body).map_err(|e| ProtoError::Encode(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let compressed = encoder.write_all(&body).and_then(|_| encoder.finish());

    let mut framed = Vec::with_capacity(body.len() + 1);
    match compressed {
        Ok(compressed) if compressed.len() < body.len() => {
            framed.push(FLAG_GZIP);
            framed.extend_from_slice(&compressed);
        }
        _ => {
            framed.push(FLAG_PLAIN);
            framed.extend_from_slice(&body);
        }
    }

    Ok(secret.seal(&framed)?)
}

/// Open a sealed envelope and decode it strictly.
pub fn decode(data: &[u8], secret: &ChannelSecret) -> Result<WireMessage> {
    let framed = secret.open(data)?;
    let (flag, body) = framed
        .split_first()
        .ok_or_else(|| ProtoError::Decode("empty envelope".into()))?;

    let plain = match *flag {
        FLAG_PLAIN => body.to_vec(),
        FLAG_GZIP => {
            let mut out = Vec::new();
            let mut decoder = GzDecoder::new(body).take(MAX_DECODED_BYTES as u64 + 1);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ProtoError::Decode(e.to_string()))?;
            if out.len() > MAX_DECODED_BYTES {
                return Err(ProtoError::DecompressBomb);
            }
            out
        }
        other => return Err(ProtoError::Decode(format!("unknown envelope flag {other}"))),
    };

    ciborium::from_reader(plain.as_slice()).map_err(|e| ProtoError::Decode(e.to_string()))
}

/// Bounded memory of recently handled request ids.
///
/// The transport can redeliver a request; answering it twice would double
/// delivery counters and bias claims.
#[derive(Debug, Default)]
pub struct RecentRequestIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl RecentRequestIds {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id`; returns false when it was already present.
    pub fn insert(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > REQUEST_ID_HISTORY {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}
