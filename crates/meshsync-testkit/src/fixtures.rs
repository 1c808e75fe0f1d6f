//! Test fixtures and helpers.
//!
//! Common setup code for unit and integration tests: a populated
//! store/registry pair, and a multi-engine swarm over the in-memory DHT.

use std::sync::Arc;
use std::time::Duration;

use meshsync::{EngineConfig, SyncEngine};
use meshsync_core::{
    Contact, Keypair, Message, MessageId, MessageKind, Node, NodeUid, SourceKind,
};
use meshsync_proto::transport::memory::MemoryDhtHub;
use meshsync_store::{MessageStore, NodeRegistry, StoreConfig};

/// A store and registry with one keyed local identity.
pub struct ChannelFixture {
    pub keypair: Keypair,
    pub store: MessageStore,
    pub registry: NodeRegistry,
}

impl ChannelFixture {
    /// Create a fixture with default store limits and a random keypair.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create with custom store limits.
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            keypair: Keypair::generate(),
            store: MessageStore::new(config),
            registry: NodeRegistry::new(),
        }
    }

    /// Create with a deterministic keypair from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            keypair: Keypair::from_seed(&seed),
            store: MessageStore::new(StoreConfig::default()),
            registry: NodeRegistry::new(),
        }
    }

    /// Register a keyed node at `address` for the given identity.
    pub fn keyed_node(&self, address: &str, keypair: &Keypair) -> Arc<Node> {
        self.registry.resolve(
            Contact::from_address(address),
            NodeUid::random(),
            Some(keypair.public_key()),
        )
    }

    /// Sign a message as `keypair` originating at `node`.
    pub fn make_message(
        &self,
        node: &Arc<Node>,
        keypair: &Keypair,
        content: &[u8],
        age_secs: u32,
    ) -> Arc<Message> {
        let id = MessageId::random();
        let signature = keypair.sign_message(&node.uid(), &id, content, None);
        Arc::new(
            Message::new(
                Arc::clone(node),
                id,
                content.to_vec(),
                None,
                signature,
                age_secs,
                Vec::new(),
                MessageKind::Normal,
                0,
                0,
            )
            .unwrap(),
        )
    }

    /// Sign a message and add it to the store as incoming traffic.
    pub fn post(
        &self,
        node: &Arc<Node>,
        keypair: &Keypair,
        content: &[u8],
        age_secs: u32,
    ) -> Arc<Message> {
        let message = self.make_message(node, keypair, content, age_secs);
        assert!(self
            .store
            .add(Arc::clone(&message), SourceKind::Incoming, 0)
            .is_accepted());
        message
    }
}

impl Default for ChannelFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A set of engines joined to one channel over an in-memory DHT.
pub struct TestSwarm {
    pub hub: Arc<MemoryDhtHub>,
    pub engines: Vec<Arc<SyncEngine>>,
}

impl TestSwarm {
    /// Spin up `n` engines on `channel`, attached at sequential addresses.
    pub fn new(n: usize, channel: &str) -> Self {
        Self::with_config(n, EngineConfig::for_channel(channel, b"swarm shared key".to_vec()))
    }

    /// Spin up `n` engines sharing one configuration.
    pub fn with_config(n: usize, config: EngineConfig) -> Self {
        let hub = MemoryDhtHub::new();
        let engines = (0..n)
            .map(|i| {
                let transport = Arc::new(hub.attach(&format!("10.0.0.{}:6881", i + 1)));
                SyncEngine::new(Keypair::generate(), transport, config.clone())
            })
            .collect();
        Self { hub, engines }
    }

    /// Tick every engine once at the given time.
    pub async fn tick_all(&self, now_ms: u64, wall_ms: i64) {
        for engine in &self.engines {
            engine.tick(now_ms, wall_ms).await;
        }
        // spawned sync sessions finish against the instantaneous hub
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Tick repeatedly until every engine retains at least `expect`
    /// messages; false when `rounds` run out first.
    pub async fn settle(&self, expect: usize, rounds: usize) -> bool {
        for round in 0..rounds {
            let now = (round as u64 + 1) * 1_000;
            self.tick_all(now, now as i64).await;
            if self.converged(expect) {
                return true;
            }
        }
        self.converged(expect)
    }

    fn converged(&self, expect: usize) -> bool {
        self.engines.iter().all(|e| e.messages().len() >= expect)
    }
}
