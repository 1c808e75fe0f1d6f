//! DHT transport contract.
//!
//! The engine consumes a distributed hash table it does not implement:
//! publish/lookup of channel membership, direct peer calls, and inbound
//! request handlers keyed by channel. Implementations wrap a real DHT;
//! the `memory` module provides a process-local network for tests.

use std::sync::Arc;

use async_trait::async_trait;

use meshsync_core::Contact;

use crate::error::Result;

/// Handles inbound requests addressed to a registered channel key.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request; `None` means no reply is sent.
    async fn handle_request(&self, from: &Contact, payload: &[u8]) -> Option<Vec<u8>>;
}

/// The distributed hash table the engine runs over.
///
/// Implementations must be thread-safe (Send + Sync). All operations may
/// fail transiently while the underlying overlay initializes; callers
/// treat [`crate::ProtoError::TransportUninitialized`] as retry-next-tick.
#[async_trait]
pub trait DhtTransport: Send + Sync {
    /// Our own contact as peers will see it.
    fn local_contact(&self) -> Contact;

    /// True once the overlay is ready for traffic. Handler registration
    /// is deferred until then.
    fn is_initialized(&self) -> bool;

    /// Publish `value` under `key`, announcing channel membership.
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Look up publishers of `key`: their contacts and published values.
    async fn get(
        &self,
        key: &[u8],
        max_hits: usize,
        timeout_ms: u64,
    ) -> Result<Vec<(Contact, Vec<u8>)>>;

    /// Send a direct request to `target` on channel `key` and await the
    /// reply.
    async fn call(
        &self,
        key: &[u8],
        target: &Contact,
        payload: &[u8],
        timeout_ms: u64,
    ) -> Result<Vec<u8>>;

    /// Register the inbound handler for channel `key`.
    fn register_handler(&self, key: &[u8], handler: Arc<dyn RequestHandler>) -> Result<()>;

    /// Remove the inbound handler for channel `key`.
    fn unregister_handler(&self, key: &[u8]);
}

/// A process-local DHT for tests: every transport attached to one hub can
/// reach every other by contact address.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::error::ProtoError;

    type HandlerKey = (String, Vec<u8>);

    struct HubInner {
        /// Published values: key -> [(publisher contact, value)].
        values: HashMap<Vec<u8>, Vec<(Contact, Vec<u8>)>>,
        /// Inbound handlers: (address, channel key) -> handler.
        handlers: HashMap<HandlerKey, Arc<dyn RequestHandler>>,
    }

    /// Shared state connecting a set of in-memory transports.
    pub struct MemoryDhtHub {
        inner: Mutex<HubInner>,
    }

    impl MemoryDhtHub {
        /// Create an empty hub.
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(HubInner {
                    values: HashMap::new(),
                    handlers: HashMap::new(),
                }),
            })
        }

        /// Attach a transport at `address`.
        pub fn attach(self: &Arc<Self>, address: &str) -> MemoryDht {
            MemoryDht {
                hub: Arc::clone(self),
                contact: Contact::from_address(address),
                initialized: AtomicBool::new(true),
            }
        }
    }

    /// One node's view of the in-memory DHT.
    pub struct MemoryDht {
        hub: Arc<MemoryDhtHub>,
        contact: Contact,
        initialized: AtomicBool,
    }

    impl MemoryDht {
        /// Toggle the initialized flag, to exercise deferred registration.
        pub fn set_initialized(&self, ready: bool) {
            self.initialized.store(ready, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DhtTransport for MemoryDht {
        fn local_contact(&self) -> Contact {
            self.contact.clone()
        }

        fn is_initialized(&self) -> bool {
            self.initialized.load(Ordering::SeqCst)
        }

        async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            if !self.is_initialized() {
                return Err(ProtoError::TransportUninitialized);
            }
            let mut inner = self.hub.inner.lock().unwrap();
            let entries = inner.values.entry(key.to_vec()).or_default();
            entries.retain(|(contact, _)| contact.address != self.contact.address);
            entries.push((self.contact.clone(), value.to_vec()));
            Ok(())
        }

        async fn get(
            &self,
            key: &[u8],
            max_hits: usize,
            _timeout_ms: u64,
        ) -> Result<Vec<(Contact, Vec<u8>)>> {
            if !self.is_initialized() {
                return Err(ProtoError::TransportUninitialized);
            }
            let inner = self.hub.inner.lock().unwrap();
            Ok(inner
                .values
                .get(key)
                .map(|entries| entries.iter().take(max_hits).cloned().collect())
                .unwrap_or_default())
        }

        async fn call(
            &self,
            key: &[u8],
            target: &Contact,
            payload: &[u8],
            _timeout_ms: u64,
        ) -> Result<Vec<u8>> {
            if !self.is_initialized() {
                return Err(ProtoError::TransportUninitialized);
            }
            let handler = {
                let inner = self.hub.inner.lock().unwrap();
                inner
                    .handlers
                    .get(&(target.address.clone(), key.to_vec()))
                    .cloned()
            };
            let Some(handler) = handler else {
                return Err(ProtoError::Timeout);
            };
            handler
                .handle_request(&self.contact, payload)
                .await
                .ok_or(ProtoError::Timeout)
        }

        fn register_handler(&self, key: &[u8], handler: Arc<dyn RequestHandler>) -> Result<()> {
            if !self.is_initialized() {
                return Err(ProtoError::TransportUninitialized);
            }
            let mut inner = self.hub.inner.lock().unwrap();
            inner
                .handlers
                .insert((self.contact.address.clone(), key.to_vec()), handler);
            Ok(())
        }

        fn unregister_handler(&self, key: &[u8]) {
            let mut inner = self.hub.inner.lock().unwrap();
            inner
                .handlers
                .remove(&(self.contact.address.clone(), key.to_vec()));
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct Echo;

        #[async_trait]
        impl RequestHandler for Echo {
            async fn handle_request(&self, _from: &Contact, payload: &[u8]) -> Option<Vec<u8>> {
                let mut out = payload.to_vec();
                out.reverse();
                Some(out)
            }
        }

        #[tokio::test]
        async fn test_put_get() {
            let hub = MemoryDhtHub::new();
            let a = hub.attach("10.0.0.1:1");
            let b = hub.attach("10.0.0.2:1");

            a.put(b"channel", b"hello").await.unwrap();
            let hits = b.get(b"channel", 16, 1_000).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].0.address, "10.0.0.1:1");
            assert_eq!(hits[0].1, b"hello");
        }

        #[tokio::test]
        async fn test_call_routes_to_handler() {
            let hub = MemoryDhtHub::new();
            let a = hub.attach("10.0.0.1:1");
            let b = hub.attach("10.0.0.2:1");
            b.register_handler(b"channel", Arc::new(Echo)).unwrap();

            let reply = a
                .call(b"channel", &b.local_contact(), b"abc", 1_000)
                .await
                .unwrap();
            assert_eq!(reply, b"cba");

            b.unregister_handler(b"channel");
            assert!(a
                .call(b"channel", &b.local_contact(), b"abc", 1_000)
                .await
                .is_err());
        }

        #[tokio::test]
        async fn test_uninitialized_transport_is_transient() {
            let hub = MemoryDhtHub::new();
            let a = hub.attach("10.0.0.1:1");
            a.set_initialized(false);
            let err = a.put(b"k", b"v").await.unwrap_err();
            assert!(err.is_transient());
        }
    }
}
