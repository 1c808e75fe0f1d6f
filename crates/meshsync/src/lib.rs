//! # meshsync
//!
//! Decentralized, eventually-consistent message synchronization over a
//! distributed hash table.
//!
//! ## Overview
//!
//! A channel is a named rendezvous: everyone who knows the channel name
//! and shared key can join, post signed messages, and converge on the
//! same bounded window of recent traffic with no central server.
//!
//! - **Messages**: Signed and immutable, ordered by age, capped in count;
//!   evictions leave tombstones so deleted messages never resurrect.
//! - **Reconciliation**: Peers exchange masked bloom summaries and send
//!   each other only what the other side is missing.
//! - **Peers**: A per-channel registry with liveness tracking, biased
//!   selection toward peers holding a backlog, and periodic pruning.
//! - **Private chats**: A two-round authenticated key exchange upgrades a
//!   pair of members to an end-to-end pairwise secret.
//! - **Defense**: Provenance chains on flooded traffic let the engine ban
//!   the relays responsible without touching the rest of the channel.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshsync::{EngineConfig, SyncEngine};
//! use meshsync::core::Keypair;
//! use meshsync::proto::transport::memory::MemoryDhtHub;
//!
//! async fn example() {
//!     let hub = MemoryDhtHub::new();
//!     let transport = Arc::new(hub.attach("10.0.0.1:6881"));
//!
//!     let engine = SyncEngine::new(
//!         Keypair::generate(),
//!         transport,
//!         EngineConfig::for_channel("my-channel", b"shared key".to_vec()),
//!     );
//!
//!     let mut inbox = engine.subscribe();
//!     tokio::spawn(Arc::clone(&engine).run());
//!
//!     engine
//!         .send(b"hello".to_vec(), None, engine.now_ms(), engine.wall_ms())
//!         .await
//!         .unwrap();
//!     while let Some(message) = inbox.recv().await {
//!         println!("{:?}", message.id());
//!     }
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `meshsync::core` - Primitives (keys, blooms, messages, nodes)
//! - `meshsync::store` - Message store, node registry, persistence
//! - `meshsync::proto` - Wire protocol, reconciliation, transport contract
//! - `meshsync::channel` - Channel secrets and the private-chat handshake

pub mod config;
pub mod counters;
pub mod engine;
pub mod error;

// Re-export component crates
pub use meshsync_channel as channel;
pub use meshsync_core as core;
pub use meshsync_proto as proto;
pub use meshsync_store as store;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use counters::EngineCounters;
pub use engine::SyncEngine;
pub use error::{EngineError, Result};

// Re-export commonly used core types
pub use meshsync_core::{
    Contact, Keypair, Message, MessageId, MessageKind, Node, NodeUid, PublicKey, Signature,
};
