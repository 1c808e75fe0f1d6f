//! # meshsync proto
//!
//! The synchronization protocol between peers: sealed wire envelopes,
//! masked bloom snapshots, set reconciliation, peer selection, flood
//! defense, and the DHT transport contract.
//!
//! Everything here is driven by the engine crate; nothing spawns tasks or
//! holds a clock of its own.

pub mod error;
pub mod flood;
pub mod reconcile;
pub mod scheduler;
pub mod snapshot;
pub mod transport;
pub mod wire;

pub use error::{ProtoError, Result};
pub use flood::{DefenseConfig, HistoryDefense, SendDecision, SendRateLimiter, SpammerLedger};
pub use reconcile::{
    apply_entries, compute_reply, ApplyContext, ApplyOutcome, ReconcileConfig, ReplyOutcome,
};
pub use scheduler::{cadence_multiplier, PeerSelector, SelectorConfig};
pub use snapshot::{mask_key, node_key, ReconSnapshot, SnapshotCache};
pub use transport::{DhtTransport, RequestHandler};
pub use wire::{
    decode, encode, RecentRequestIds, SyncReply, SyncRequest, SyncStatus, WireMessage,
    WireMessageEntry,
};
