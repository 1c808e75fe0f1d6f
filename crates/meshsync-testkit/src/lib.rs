//! # meshsync testkit
//!
//! Testing utilities for meshsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Helper structs for setting up test scenarios
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Fixtures
//!
//! Quickly set up a populated store and registry:
//!
//! ```rust
//! use meshsync_testkit::fixtures::ChannelFixture;
//!
//! let fixture = ChannelFixture::new();
//! let author = meshsync::Keypair::generate();
//! let node = fixture.keyed_node("10.0.0.9:6881", &author);
//! fixture.post(&node, &author, b"hello", 30);
//! assert_eq!(fixture.store.len(), 1);
//! ```
//!
//! Or a whole swarm over the in-memory DHT:
//!
//! ```rust,no_run
//! use meshsync_testkit::fixtures::TestSwarm;
//!
//! async fn example() {
//!     let swarm = TestSwarm::new(3, "test-channel");
//!     swarm.engines[0]
//!         .send(b"hi".to_vec(), None, 0, 0)
//!         .await
//!         .unwrap();
//!     assert!(swarm.settle(1, 10).await);
//! }
//! ```
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use meshsync_testkit::generators;
//!
//! proptest! {
//!     #[test]
//!     fn uid_roundtrips(uid in generators::node_uid()) {
//!         prop_assert_eq!(uid, meshsync::NodeUid::from_bytes(*uid.as_bytes()));
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{ChannelFixture, TestSwarm};
