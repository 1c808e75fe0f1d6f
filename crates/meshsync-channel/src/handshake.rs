//! Station-to-station key exchange for private chats.
//!
//! Two request/reply rounds keyed by a caller-chosen 8-byte activity id:
//!
//! 1. initiator sends ephemeral X25519 material; the responder answers
//!    with its own material, its identity key, and an authentication tag
//!    (Ed25519 signature over the transcript);
//! 2. the initiator verifies the tag, checks the identity against the key
//!    it set out to reach, and sends its own tag back.
//!
//! The pairwise secret is derived only after mutual tag verification. The
//! responder bounds concurrent work: per-address attempts through a
//! counting bloom and a global in-flight activity cap, both typed refusals
//! rather than blocking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use meshsync_core::{CountingBloomFilter, Keypair, PublicKey, Signature};

use crate::error::{ChannelError, Result};
use crate::secret::{ChannelSecret, KexPublic, KexSecret};

/// Caller-chosen 8-byte id correlating the two handshake rounds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityId(pub [u8; 8]);

impl ActivityId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Generate a random activity id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Activity({})", hex::encode(self.0))
    }
}

/// Handshake wire payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// Round 1 request: initiator's key agreement material.
    Initiate {
        activity: ActivityId,
        kex_public: KexPublic,
    },
    /// Round 1 reply: responder's material, identity, and auth tag.
    InitiateReply {
        activity: ActivityId,
        kex_public: KexPublic,
        identity: PublicKey,
        auth: Signature,
    },
    /// Round 2 request: initiator's identity and auth tag.
    Complete {
        activity: ActivityId,
        identity: PublicKey,
        auth: Signature,
    },
    /// Round 2 reply.
    CompleteReply { activity: ActivityId },
    /// Typed refusal or failure, carried back to the requester.
    Error {
        activity: ActivityId,
        reason: String,
    },
}

/// Responder-side resource limits and the shared activity lifetime.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Concurrent attempts allowed per requesting address.
    pub max_per_address: u8,
    /// Concurrent responder activities allowed overall.
    pub max_activities: usize,
    /// Activities older than this are garbage collected.
    pub activity_ttl_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_per_address: 8,
            max_activities: 16,
            activity_ttl_ms: 60_000,
        }
    }
}

struct InitiatorSession {
    kex: KexSecret,
    expected: PublicKey,
    started_ms: u64,
}

struct ResponderSession {
    kex: KexSecret,
    initiator_kex: KexPublic,
    started_ms: u64,
}

struct EngineInner {
    initiated: HashMap<ActivityId, InitiatorSession>,
    responding: HashMap<ActivityId, ResponderSession>,
    address_attempts: CountingBloomFilter,
}

/// Both sides of the station-to-station exchange.
pub struct HandshakeEngine {
    identity: Keypair,
    config: HandshakeConfig,
    inner: Mutex<EngineInner>,
}

impl HandshakeEngine {
    /// Create an engine signing with `identity`.
    pub fn new(identity: Keypair, config: HandshakeConfig) -> Self {
        Self {
            identity,
            config,
            inner: Mutex::new(EngineInner {
                initiated: HashMap::new(),
                responding: HashMap::new(),
                address_attempts: CountingBloomFilter::new(1024),
            }),
        }
    }

    /// Our identity key.
    pub fn identity(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Start a handshake aimed at `expected` and produce the round 1
    /// request.
    pub fn initiate(
        &self,
        activity: ActivityId,
        expected: PublicKey,
        now_ms: u64,
    ) -> HandshakeMessage {
        let kex = KexSecret::generate();
        let kex_public = kex.public();
        let mut inner = self.inner.lock().unwrap();
        inner.initiated.insert(
            activity,
            InitiatorSession {
                kex,
                expected,
                started_ms: now_ms,
            },
        );
        HandshakeMessage::Initiate {
            activity,
            kex_public,
        }
    }

    /// Responder: answer a round 1 request from `address`.
    pub fn handle_initiate(
        &self,
        activity: ActivityId,
        initiator_kex: KexPublic,
        address: &str,
        now_ms: u64,
    ) -> Result<HandshakeMessage> {
        let mut inner = self.inner.lock().unwrap();

        // a replay must not clobber the in-flight session mid-round
        if inner.responding.contains_key(&activity) {
            warn!(?activity, "refusing handshake: activity already in flight");
            return Err(ChannelError::BadState("activity already in flight"));
        }
        if inner.address_attempts.count(address.as_bytes())
            >= self.config.max_per_address
        {
            warn!(address, "refusing handshake: address overloaded");
            return Err(ChannelError::AddressOverloaded);
        }
        if inner.responding.len() >= self.config.max_activities {
            warn!("refusing handshake: too many concurrent activities");
            return Err(ChannelError::TooManyActivities);
        }
        inner.address_attempts.add(address.as_bytes());

        let kex = KexSecret::generate();
        let kex_public = kex.public();
        let auth = self
            .identity
            .sign(&transcript(&activity, &initiator_kex, &kex_public));
        inner.responding.insert(
            activity,
            ResponderSession {
                kex,
                initiator_kex,
                started_ms: now_ms,
            },
        );
        debug!(?activity, "handshake round 1 answered");
        Ok(HandshakeMessage::InitiateReply {
            activity,
            kex_public,
            identity: self.identity.public_key(),
            auth,
        })
    }

    /// Initiator: process the round 1 reply and produce the round 2
    /// request plus the derived pairwise secret.
    ///
    /// An identity mismatch is fatal for the session; the activity is
    /// dropped and must not be retried.
    pub fn handle_initiate_reply(
        &self,
        activity: ActivityId,
        responder_kex: KexPublic,
        identity: PublicKey,
        auth: &Signature,
    ) -> Result<(HandshakeMessage, ChannelSecret)> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .initiated
                .remove(&activity)
                .ok_or_else(|| ChannelError::UnknownActivity(hex::encode(activity.0)))?
        };

        let our_kex = session.kex.public();
        let transcript_bytes = transcript(&activity, &our_kex, &responder_kex);
        identity
            .verify(&transcript_bytes, auth)
            .map_err(|_| ChannelError::AuthFailed)?;
        if identity != session.expected {
            warn!(?activity, "handshake negotiated an unexpected identity");
            return Err(ChannelError::KeyMismatch);
        }

        let dh = session.kex.agree(&responder_kex);
        let secret = ChannelSecret::pairwise(&dh, &transcript_bytes);
        let our_auth = self.identity.sign(&transcript_bytes);
        Ok((
            HandshakeMessage::Complete {
                activity,
                identity: self.identity.public_key(),
                auth: our_auth,
            },
            secret,
        ))
    }

    /// Responder: verify the round 2 request and derive the pairwise
    /// secret. Returns the initiator's authenticated identity as well.
    pub fn handle_complete(
        &self,
        activity: ActivityId,
        identity: PublicKey,
        auth: &Signature,
    ) -> Result<(PublicKey, ChannelSecret)> {
        let session = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .responding
                .remove(&activity)
                .ok_or_else(|| ChannelError::UnknownActivity(hex::encode(activity.0)))?
        };

        let our_kex = session.kex.public();
        let transcript_bytes = transcript(&activity, &session.initiator_kex, &our_kex);
        identity
            .verify(&transcript_bytes, auth)
            .map_err(|_| ChannelError::AuthFailed)?;

        let dh = session.kex.agree(&session.initiator_kex);
        let secret = ChannelSecret::pairwise(&dh, &transcript_bytes);
        debug!(?activity, "handshake complete");
        Ok((identity, secret))
    }

    /// Drop activities older than the configured lifetime and reset the
    /// per-address attempt counters. Called on the 60-second housekeeping
    /// cadence.
    pub fn gc(&self, now_ms: u64) {
        let ttl = self.config.activity_ttl_ms;
        let mut inner = self.inner.lock().unwrap();
        inner
            .initiated
            .retain(|_, s| now_ms.saturating_sub(s.started_ms) < ttl);
        inner
            .responding
            .retain(|_, s| now_ms.saturating_sub(s.started_ms) < ttl);
        inner.address_attempts.clear();
    }

    /// In-flight activity count across both roles.
    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.initiated.len() + inner.responding.len()
    }
}

fn transcript(activity: &ActivityId, initiator: &KexPublic, responder: &KexPublic) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 64);
    out.extend_from_slice(&activity.0);
    out.extend_from_slice(initiator.as_bytes());
    out.extend_from_slice(responder.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engines() -> (HandshakeEngine, HandshakeEngine) {
        (
            HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default()),
            HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default()),
        )
    }

    fn run_round1(
        alice: &HandshakeEngine,
        bob: &HandshakeEngine,
        activity: ActivityId,
    ) -> (KexPublic, HandshakeMessage) {
        let init = alice.initiate(activity, bob.identity(), 0);
        let HandshakeMessage::Initiate { kex_public, .. } = init else {
            panic!("expected Initiate");
        };
        let reply = bob
            .handle_initiate(activity, kex_public, "10.0.0.1:1", 0)
            .unwrap();
        (kex_public, reply)
    }

    #[test]
    fn test_full_exchange_agrees() {
        let (alice, bob) = engines();
        let activity = ActivityId::random();
        let (_, reply) = run_round1(&alice, &bob, activity);

        let HandshakeMessage::InitiateReply {
            kex_public,
            identity,
            auth,
            ..
        } = reply
        else {
            panic!("expected InitiateReply");
        };

        let (complete, alice_secret) = alice
            .handle_initiate_reply(activity, kex_public, identity, &auth)
            .unwrap();
        let HandshakeMessage::Complete { identity, auth, .. } = complete else {
            panic!("expected Complete");
        };

        let (who, bob_secret) = bob.handle_complete(activity, identity, &auth).unwrap();
        assert_eq!(who, alice.identity());
        assert_eq!(alice_secret.as_bytes(), bob_secret.as_bytes());
    }

    #[test]
    fn test_identity_mismatch_is_fatal() {
        let alice = HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default());
        let mallory = HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default());
        let someone_else = Keypair::generate().public_key();

        let activity = ActivityId::random();
        let init = alice.initiate(activity, someone_else, 0);
        let HandshakeMessage::Initiate { kex_public, .. } = init else {
            panic!("expected Initiate");
        };
        let reply = mallory
            .handle_initiate(activity, kex_public, "10.0.0.9:1", 0)
            .unwrap();
        let HandshakeMessage::InitiateReply {
            kex_public,
            identity,
            auth,
            ..
        } = reply
        else {
            panic!("expected InitiateReply");
        };

        let err = alice
            .handle_initiate_reply(activity, kex_public, identity, &auth)
            .unwrap_err();
        assert!(matches!(err, ChannelError::KeyMismatch));
        // the session is gone; a retry gets an unknown-activity error
        let err = alice
            .handle_initiate_reply(activity, kex_public, identity, &auth)
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnknownActivity(_)));
    }

    #[test]
    fn test_bad_auth_rejected() {
        let (alice, bob) = engines();
        let activity = ActivityId::random();
        let (_, reply) = run_round1(&alice, &bob, activity);
        let HandshakeMessage::InitiateReply {
            kex_public,
            identity,
            mut auth,
            ..
        } = reply
        else {
            panic!("expected InitiateReply");
        };
        auth.0[0] ^= 1;
        let err = alice
            .handle_initiate_reply(activity, kex_public, identity, &auth)
            .unwrap_err();
        assert!(matches!(err, ChannelError::AuthFailed));
    }

    #[test]
    fn test_address_attempt_limit() {
        let bob = HandshakeEngine::new(
            Keypair::generate(),
            HandshakeConfig {
                max_activities: 1000,
                ..HandshakeConfig::default()
            },
        );
        let kex = KexSecret::generate().public();
        for _ in 0..8 {
            bob.handle_initiate(ActivityId::random(), kex, "10.0.0.1:1", 0)
                .unwrap();
        }
        let err = bob
            .handle_initiate(ActivityId::random(), kex, "10.0.0.1:1", 0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::AddressOverloaded));
        // other addresses are unaffected
        bob.handle_initiate(ActivityId::random(), kex, "10.0.0.2:1", 0)
            .unwrap();
    }

    #[test]
    fn test_replayed_initiate_refused() {
        let bob = HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default());
        let kex = KexSecret::generate().public();
        let activity = ActivityId::random();
        bob.handle_initiate(activity, kex, "10.0.0.1:1", 0).unwrap();

        // a second round 1 under the same activity must not reset the session
        let replay = KexSecret::generate().public();
        let err = bob
            .handle_initiate(activity, replay, "10.0.0.1:1", 0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::BadState(_)));
        assert_eq!(bob.active_count(), 1);
    }

    #[test]
    fn test_global_activity_limit() {
        let bob = HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default());
        let kex = KexSecret::generate().public();
        for i in 0..16 {
            bob.handle_initiate(ActivityId::random(), kex, &format!("10.0.1.{i}:1"), 0)
                .unwrap();
        }
        let err = bob
            .handle_initiate(ActivityId::random(), kex, "10.0.2.1:1", 0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::TooManyActivities));
    }

    #[test]
    fn test_gc_expires_stale_activities() {
        let bob = HandshakeEngine::new(Keypair::generate(), HandshakeConfig::default());
        let kex = KexSecret::generate().public();
        bob.handle_initiate(ActivityId::random(), kex, "10.0.0.1:1", 0)
            .unwrap();
        assert_eq!(bob.active_count(), 1);
        bob.gc(59_000);
        assert_eq!(bob.active_count(), 1);
        bob.gc(61_000);
        assert_eq!(bob.active_count(), 0);
        // attempt counters reset alongside
        for _ in 0..8 {
            bob.handle_initiate(ActivityId::random(), kex, "10.0.0.1:1", 61_000)
                .unwrap();
        }
    }
}
