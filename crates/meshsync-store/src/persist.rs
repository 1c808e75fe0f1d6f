//! Persisted channel state: CBOR snapshot of nodes and messages.
//!
//! Message content is encrypted by the caller (under the channel's general
//! secret) before capture, so the snapshot on disk leaks no plaintext.
//! Ages are stored as-of capture time and rebased by elapsed wall time on
//! load, so a restarted channel rejoins with honest message ages.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use meshsync_core::{
    Contact, Message, MessageId, MessageKind, NodeUid, PublicKey, Signature, SourceKind,
};

use crate::error::{Result, StoreError};
use crate::messages::MessageStore;
use crate::nodes::NodeRegistry;

/// One peer referenced by persisted messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedNode {
    /// Stable peer id.
    pub uid: NodeUid,
    /// Identity key, when known at capture.
    pub public_key: Option<PublicKey>,
    /// Preferred contact at capture.
    pub contact: Contact,
}

/// One persisted message, content already encrypted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMessage {
    /// Index into the snapshot's node table.
    pub node: u32,
    /// Message id.
    pub id: MessageId,
    /// Encrypted content.
    pub content: Vec<u8>,
    /// Signature over the plaintext payload.
    pub signature: Signature,
    /// Age in seconds as of capture.
    pub age_secs: u32,
    /// Provenance chain.
    pub history: Vec<u8>,
    /// Control payload, if any.
    pub control: Option<Vec<u8>>,
    /// Local-only annotation, if any.
    pub annotation: Option<String>,
}

/// A complete channel snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    /// Wall clock at capture, for age rebasing on load.
    pub capture_wall_ms: i64,
    /// Node table keyed by the indices used in `messages`.
    pub nodes: BTreeMap<u32, PersistedNode>,
    /// Messages, oldest first.
    pub messages: Vec<PersistedMessage>,
}

impl PersistedState {
    /// Capture the store's current contents.
    ///
    /// `encrypt` seals each message's content; the signature stays over the
    /// plaintext and is re-verified after decryption on load.
    pub fn capture(
        store: &MessageStore,
        now_ms: u64,
        wall_ms: i64,
        mut encrypt: impl FnMut(&[u8]) -> Vec<u8>,
    ) -> Self {
        let mut nodes: BTreeMap<u32, PersistedNode> = BTreeMap::new();
        let mut node_index: Vec<(usize, u32)> = Vec::new();
        let mut messages = Vec::new();

        for message in store.messages() {
            if message.is_local_notice() {
                continue;
            }
            let node = message.node();
            let key = Arc::as_ptr(node) as usize;
            let idx = match node_index.iter().find(|(ptr, _)| *ptr == key) {
                Some((_, idx)) => *idx,
                None => {
                    let idx = nodes.len() as u32;
                    nodes.insert(
                        idx,
                        PersistedNode {
                            uid: node.uid(),
                            public_key: node.public_key(),
                            contact: node.contact(),
                        },
                    );
                    node_index.push((key, idx));
                    idx
                }
            };
            messages.push(PersistedMessage {
                node: idx,
                id: message.id(),
                content: encrypt(message.content()),
                signature: *message.signature(),
                age_secs: message.age_secs(now_ms),
                history: message.history().to_vec(),
                control: message.control().map(<[u8]>::to_vec),
                annotation: message.local_annotation(),
            });
        }

        Self {
            capture_wall_ms: wall_ms,
            nodes,
            messages,
        }
    }

    /// Restore a snapshot into `registry` and `store`, rebasing ages by the
    /// wall time elapsed since capture.
    ///
    /// `decrypt` opens each message's content; messages that fail to open
    /// are skipped. Returns the number of messages restored.
    pub fn restore(
        &self,
        registry: &NodeRegistry,
        store: &MessageStore,
        now_ms: u64,
        wall_ms: i64,
        mut decrypt: impl FnMut(&[u8]) -> Option<Vec<u8>>,
    ) -> usize {
        let elapsed_secs =
            u32::try_from((wall_ms - self.capture_wall_ms).max(0) / 1000).unwrap_or(u32::MAX);

        let mut restored = 0;
        for persisted in &self.messages {
            let Some(node_entry) = self.nodes.get(&persisted.node) else {
                warn!(index = persisted.node, "persisted message references unknown node");
                continue;
            };
            let Some(content) = decrypt(&persisted.content) else {
                warn!(id = ?persisted.id, "persisted message failed to decrypt, skipped");
                continue;
            };

            let node = registry.resolve(
                node_entry.contact.clone(),
                node_entry.uid,
                node_entry.public_key,
            );
            let age = persisted.age_secs.saturating_add(elapsed_secs);
            let message = match Message::new(
                node,
                persisted.id,
                content,
                persisted.control.clone(),
                persisted.signature,
                age,
                persisted.history.clone(),
                MessageKind::Normal,
                now_ms,
                wall_ms,
            ) {
                Ok(message) => Arc::new(message),
                Err(err) => {
                    warn!(id = ?persisted.id, %err, "persisted message rejected, skipped");
                    continue;
                }
            };
            if let Some(text) = &persisted.annotation {
                message.set_local_annotation(text.clone());
            }
            if store.add(message, SourceKind::Loading, now_ms).is_accepted() {
                restored += 1;
            }
        }
        debug!(restored, total = self.messages.len(), "restored persisted state");
        restored
    }

    /// Encode to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(out)
    }

    /// Decode from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes).map_err(|e| StoreError::InvalidData(e.to_string()))
    }

    /// Write atomically to `path` via a temp-file rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load from `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StoreConfig;
    use meshsync_core::Keypair;

    fn populated_store() -> (MessageStore, NodeRegistry, Keypair) {
        let store = MessageStore::new(StoreConfig::default());
        let registry = NodeRegistry::new();
        let keypair = Keypair::generate();
        let node = registry.resolve(
            Contact::from_address("10.0.0.1:6881"),
            NodeUid::random(),
            Some(keypair.public_key()),
        );
        for (i, age) in [(0u8, 120u32), (1, 60), (2, 5)] {
            let id = MessageId::random();
            let content = vec![i; 4];
            let sig = keypair.sign_message(&node.uid(), &id, &content, None);
            let message = Message::new(
                Arc::clone(&node),
                id,
                content,
                None,
                sig,
                age,
                Vec::new(),
                MessageKind::Normal,
                0,
                1_000_000,
            )
            .unwrap();
            assert!(store
                .add(Arc::new(message), SourceKind::Incoming, 0)
                .is_accepted());
        }
        (store, registry, keypair)
    }

    #[test]
    fn test_roundtrip_with_age_rebase() {
        let (store, _registry, _keypair) = populated_store();
        let state = PersistedState::capture(&store, 0, 1_000_000, |c| c.to_vec());
        assert_eq!(state.messages.len(), 3);
        assert_eq!(state.nodes.len(), 1);

        let bytes = state.to_bytes().unwrap();
        let reloaded = PersistedState::from_bytes(&bytes).unwrap();

        // restart 90 seconds later
        let registry2 = NodeRegistry::new();
        let store2 = MessageStore::new(StoreConfig::default());
        let restored =
            reloaded.restore(&registry2, &store2, 0, 1_090_000, |c| Some(c.to_vec()));
        assert_eq!(restored, 3);
        assert_eq!(store2.oldest_age_secs(0), Some(210));
        // loading never bumps the new-message counter
        assert_eq!(store2.new_message_count(), 0);
        assert_eq!(registry2.len(), 1);
    }

    #[test]
    fn test_restore_skips_undecryptable() {
        let (store, _registry, _keypair) = populated_store();
        let state = PersistedState::capture(&store, 0, 1_000_000, |c| c.to_vec());

        let registry2 = NodeRegistry::new();
        let store2 = MessageStore::new(StoreConfig::default());
        let mut calls = 0;
        let restored = reloaded_restore(&state, &registry2, &store2, &mut calls);
        assert_eq!(restored, 2);
        assert_eq!(calls, 3);
    }

    fn reloaded_restore(
        state: &PersistedState,
        registry: &NodeRegistry,
        store: &MessageStore,
        calls: &mut usize,
    ) -> usize {
        state.restore(registry, store, 0, 1_000_000, |c| {
            *calls += 1;
            if *calls == 2 {
                None
            } else {
                Some(c.to_vec())
            }
        })
    }

    #[test]
    fn test_save_load_file() {
        let (store, _registry, _keypair) = populated_store();
        let state = PersistedState::capture(&store, 0, 1_000_000, |c| c.to_vec());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.state");
        state.save_to(&path).unwrap();
        let loaded = PersistedState::load_from(&path).unwrap();
        assert_eq!(loaded.messages.len(), state.messages.len());
        assert_eq!(loaded.capture_wall_ms, state.capture_wall_ms);
    }
}
