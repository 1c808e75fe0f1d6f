//! # meshsync store
//!
//! Channel-local state: the bounded, age-ordered message store with replay
//! tombstones, the uid-indexed node registry with pruning, and the CBOR
//! persisted-state snapshot.
//!
//! Each structure serializes its own interior mutability; callers that hold
//! references to both always take the message store before the registry.

pub mod error;
pub mod messages;
pub mod nodes;
pub mod persist;

pub use error::{Result, StoreError};
pub use messages::{AddOutcome, MessageStore, StoreConfig};
pub use nodes::{NodeCounts, NodeRegistry};
pub use persist::{PersistedMessage, PersistedNode, PersistedState};
