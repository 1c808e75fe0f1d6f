//! Engine configuration.

use std::path::PathBuf;

use meshsync_channel::HandshakeConfig;
use meshsync_core::PublicKey;
use meshsync_proto::{DefenseConfig, ReconcileConfig, SelectorConfig};
use meshsync_store::StoreConfig;

/// Configuration for one channel's sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Human-readable channel name; with the shared key it derives the
    /// channel secret and the DHT key.
    pub channel_name: String,
    /// Shared key material every member knows.
    pub shared_key: Vec<u8>,
    /// When set, only this identity may post non-control messages.
    pub read_only_owner: Option<PublicKey>,
    /// Timer tick interval, milliseconds.
    pub tick_ms: u64,
    /// Grace period on teardown while own messages are undelivered.
    pub linger_ms: u64,
    /// Worker pool permits shared by outbound sync sessions.
    pub worker_permits: usize,
    /// Where to persist channel state; `None` disables persistence.
    pub persist_path: Option<PathBuf>,
    /// Message store tuning.
    pub store: StoreConfig,
    /// Reconciliation tuning.
    pub reconcile: ReconcileConfig,
    /// Peer selection tuning.
    pub selector: SelectorConfig,
    /// Flood defense tuning.
    pub defense: DefenseConfig,
    /// Handshake limits.
    pub handshake: HandshakeConfig,
}

impl EngineConfig {
    /// Config for a named channel with the given shared key.
    pub fn for_channel(name: impl Into<String>, shared_key: impl Into<Vec<u8>>) -> Self {
        Self {
            channel_name: name.into(),
            shared_key: shared_key.into(),
            read_only_owner: None,
            tick_ms: 30_000,
            linger_ms: 20_000,
            worker_permits: 32,
            persist_path: None,
            store: StoreConfig::default(),
            reconcile: ReconcileConfig::default(),
            selector: SelectorConfig::default(),
            defense: DefenseConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}
