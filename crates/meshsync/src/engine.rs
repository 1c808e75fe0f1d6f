//! The channel engine: one instance per joined channel, tying the message
//! store, node registry, reconciliation machinery, and flood defense to a
//! DHT transport and a timer tick.
//!
//! All time flows in through explicit `now_ms` (monotonic) and `wall_ms`
//! (wall clock) parameters on the mutating entry points; [`SyncEngine::run`]
//! is the production driver that feeds them from real clocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use meshsync_channel::{ActivityId, ChannelSecret, HandshakeEngine, HandshakeMessage};
use meshsync_core::{
    limits, Contact, Keypair, Message, MessageId, MessageKind, MovingAverage, Node, NodeUid,
    PublicKey, Signature, SourceKind, MIN_PROTOCOL_VERSION,
};
use meshsync_proto::{
    apply_entries, cadence_multiplier, compute_reply, decode, encode, ApplyContext, DhtTransport,
    HistoryDefense, PeerSelector, ProtoError, RecentRequestIds, RequestHandler, SendRateLimiter,
    SnapshotCache, SpammerLedger, SyncReply, SyncRequest, SyncStatus, WireMessage,
};
use meshsync_store::{AddOutcome, MessageStore, NodeRegistry, PersistedState};

use crate::config::EngineConfig;
use crate::counters::EngineCounters;
use crate::error::{EngineError, Result};

/// Timeout for a direct peer call.
const CALL_TIMEOUT_MS: u64 = 20_000;
/// Timeout for a DHT membership lookup.
const LOOKUP_TIMEOUT_MS: u64 = 30_000;
/// Ticks between membership re-announcements.
const ANNOUNCE_EVERY_TICKS: u64 = 20;
/// An own message undelivered this long gets a local annotation.
const UNDELIVERED_ANNOTATE_SECS: u32 = 60;

/// Tallies the address family of inbound requesters. Dual-stack nodes
/// publish both families; once a channel's traffic has settled on one we
/// reorder contacts to match.
#[derive(Debug, Default)]
struct FamilyVotes {
    v4: u32,
    v6: u32,
    first_vote_ms: Option<u64>,
}

impl FamilyVotes {
    fn vote(&mut self, is_v6: bool, now_ms: u64) {
        if self.first_vote_ms.is_none() {
            self.first_vote_ms = Some(now_ms);
        }
        if is_v6 {
            self.v6 += 1;
        } else {
            self.v4 += 1;
        }
    }

    /// `Some(prefer_v6)` once the sample has settled: at least two minutes
    /// of votes and one family five ahead with the other absent.
    fn hint(&self, now_ms: u64) -> Option<bool> {
        let first = self.first_vote_ms?;
        if now_ms.saturating_sub(first) < 120_000 {
            return None;
        }
        if self.v6 >= 5 && self.v4 == 0 {
            Some(true)
        } else if self.v4 >= 5 && self.v6 == 0 {
            Some(false)
        } else {
            None
        }
    }
}

struct EngineState {
    handler_registered: bool,
    tick_count: u64,
    last_saved_mutation: u64,
    /// Pairwise secrets from completed handshakes, keyed by peer identity.
    peer_secrets: HashMap<PublicKey, ChannelSecret>,
    /// The liveish peer we hand to sparse requesters.
    peer_hint: Option<(NodeUid, Contact)>,
    /// Backlog the last responder reported holding for us.
    pending_in: u64,
    in_this_tick: u64,
    out_this_tick: u64,
    in_avg: MovingAverage,
    out_avg: MovingAverage,
    family: FamilyVotes,
}

/// One channel's synchronization engine.
pub struct SyncEngine {
    config: EngineConfig,
    keypair: Keypair,
    uid: NodeUid,
    /// DHT rendezvous key: hash of the channel name.
    dht_key: Vec<u8>,
    secret: ChannelSecret,
    store: MessageStore,
    registry: NodeRegistry,
    snapshots: SnapshotCache,
    selector: PeerSelector,
    defense: HistoryDefense,
    spammers: SpammerLedger,
    handshakes: HandshakeEngine,
    transport: Arc<dyn DhtTransport>,
    workers: Arc<Semaphore>,
    my_node: Arc<Node>,
    rate: Mutex<SendRateLimiter>,
    request_ids: Mutex<RecentRequestIds>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<Arc<Message>>>>,
    state: Mutex<EngineState>,
    started: Instant,
    epoch_wall_ms: i64,
    /// Set when teardown begins: sends are refused, syncing continues.
    destroying: AtomicBool,
    /// Set once the linger window closes: the engine is fully inert.
    destroyed: AtomicBool,
}

impl SyncEngine {
    /// Join a channel: derive its secret and rendezvous key, restore any
    /// persisted state, and return the engine ready for ticking.
    pub fn new(
        keypair: Keypair,
        transport: Arc<dyn DhtTransport>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let uid = NodeUid::random();
        let secret = ChannelSecret::general(&config.channel_name, &config.shared_key);
        let dht_key = blake3::hash(config.channel_name.as_bytes())
            .as_bytes()
            .to_vec();

        let mut store_config = config.store.clone();
        if store_config.read_only_owner.is_none() {
            store_config.read_only_owner = config.read_only_owner;
        }
        let store = MessageStore::new(store_config);
        let registry = NodeRegistry::new();
        let my_node = registry.resolve(transport.local_contact(), uid, Some(keypair.public_key()));

        let epoch_wall_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let engine = Arc::new(Self {
            handshakes: HandshakeEngine::new(keypair.clone(), config.handshake.clone()),
            defense: HistoryDefense::new(config.defense.clone()),
            spammers: SpammerLedger::new(config.defense.spammer_pool),
            selector: PeerSelector::new(config.selector.clone()),
            workers: Arc::new(Semaphore::new(config.worker_permits)),
            snapshots: SnapshotCache::default(),
            rate: Mutex::new(SendRateLimiter::new(SendRateLimiter::DEFAULT_LIMIT)),
            request_ids: Mutex::new(RecentRequestIds::new()),
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(EngineState {
                handler_registered: false,
                tick_count: 0,
                last_saved_mutation: 0,
                peer_secrets: HashMap::new(),
                peer_hint: None,
                pending_in: 0,
                in_this_tick: 0,
                out_this_tick: 0,
                in_avg: MovingAverage::new(10),
                out_avg: MovingAverage::new(10),
                family: FamilyVotes::default(),
            }),
            started: Instant::now(),
            destroying: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            config,
            keypair,
            uid,
            dht_key,
            secret,
            store,
            registry,
            transport,
            my_node,
            epoch_wall_ms,
        });
        engine.restore_persisted(engine.now_ms(), engine.wall_ms());
        engine
    }

    /// This session's node uid.
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// Our identity key.
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Milliseconds since the engine started.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Current wall-clock milliseconds since the Unix epoch.
    pub fn wall_ms(&self) -> i64 {
        self.epoch_wall_ms + self.now_ms() as i64
    }

    /// Retained channel messages, oldest first, local notices excluded.
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.store
            .messages()
            .into_iter()
            .filter(|m| !m.is_local_notice())
            .collect()
    }

    /// Subscribe to messages as they arrive: own sends, peer messages, and
    /// local notices.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<Message>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// A point-in-time health snapshot.
    pub fn counters(&self) -> EngineCounters {
        let nodes = self.registry.counts();
        let state = self.state.lock().unwrap();
        EngineCounters {
            message_count: self.messages().len(),
            undelivered_out: self.undelivered_own(),
            pending_in: state.pending_in,
            in_requests_per_tick: state.in_avg.average(),
            out_requests_per_tick: state.out_avg.average(),
            estimated_live_peers: nodes.live.max(state.in_avg.average().ceil() as usize),
            banned_fingerprints: self.defense.banned_count(),
            nodes,
        }
    }

    fn emit(&self, message: &Arc<Message>) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(Arc::clone(message)).is_ok());
    }

    /// Synthesize a local notice for the user. Never stored, never offered
    /// to peers.
    fn notice(&self, kind: MessageKind, text: &str, now_ms: u64, wall_ms: i64) {
        let id = MessageId::random();
        let content = text.as_bytes().to_vec();
        let signature = self.keypair.sign_message(&self.uid, &id, &content, None);
        match Message::new(
            Arc::clone(&self.my_node),
            id,
            content,
            None,
            signature,
            0,
            Vec::new(),
            kind,
            now_ms,
            wall_ms,
        ) {
            Ok(message) => self.emit(&Arc::new(message)),
            Err(err) => warn!(%err, "failed to synthesize local notice"),
        }
    }

    /// Post a message to the channel.
    ///
    /// Applies the send rate limit: past a quarter of the per-minute budget
    /// the send is delayed, with a single warning notice per window once
    /// three quarters are spent.
    pub async fn send(
        &self,
        content: impl Into<Vec<u8>>,
        control: Option<Vec<u8>>,
        now_ms: u64,
        wall_ms: i64,
    ) -> Result<Arc<Message>> {
        if self.destroying.load(Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        let decision = self.rate.lock().unwrap().register(now_ms);
        if decision.warn {
            self.notice(
                MessageKind::LocalInfo,
                "sending rapidly; deliveries are being spaced out",
                now_ms,
                wall_ms,
            );
        }
        if decision.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(decision.delay_ms)).await;
        }

        let content = content.into();
        let id = MessageId::random();
        let signature = self
            .keypair
            .sign_message(&self.uid, &id, &content, control.as_deref());
        let message = Arc::new(Message::new(
            Arc::clone(&self.my_node),
            id,
            content,
            control,
            signature,
            0,
            Vec::new(),
            MessageKind::Normal,
            now_ms,
            wall_ms,
        )?);

        let reason = match self.store.add(Arc::clone(&message), SourceKind::Local, now_ms) {
            AddOutcome::Accepted => None,
            AddOutcome::DuplicateSignature => Some("duplicate message"),
            AddOutcome::Tombstoned => Some("message was already deleted"),
            AddOutcome::ReadOnly => Some("channel is read-only"),
            AddOutcome::EvictedImmediately => Some("message is older than everything retained"),
        };
        if let Some(reason) = reason {
            self.notice(MessageKind::LocalError, reason, now_ms, wall_ms);
            return Err(EngineError::SendRejected(reason));
        }

        // spread fresh messages promptly
        self.selector.request_prefer_live();
        self.emit(&message);
        Ok(message)
    }

    /// Handle one inbound sealed payload; `None` sends no reply.
    pub fn handle_payload(&self, from: &Contact, payload: &[u8], now_ms: u64) -> Option<Vec<u8>> {
        let message = match decode(payload, &self.secret) {
            Ok(message) => message,
            Err(err) => {
                debug!(from = %from.address, %err, "undecodable payload dropped");
                return None;
            }
        };
        match message {
            WireMessage::SyncRequest(request) => self.handle_sync_request(from, request, now_ms),
            WireMessage::Handshake(handshake) => self.handle_handshake(from, handshake, now_ms),
            WireMessage::SyncReply(_) => {
                debug!(from = %from.address, "unsolicited sync reply dropped");
                None
            }
        }
    }

    fn handle_sync_request(
        &self,
        from: &Contact,
        request: SyncRequest,
        now_ms: u64,
    ) -> Option<Vec<u8>> {
        if request.version < MIN_PROTOCOL_VERSION {
            debug!(version = request.version, "request from outdated peer ignored");
            return None;
        }
        if request.uid == self.uid && !cfg!(feature = "loopback-test") {
            // our own request routed back through a stale contact
            let reply = SyncReply {
                status: SyncStatus::Loopback,
                uid: self.uid,
                messages: Vec::new(),
                more: 0,
                peer_hint: None,
            };
            return encode(&WireMessage::SyncReply(reply), &self.secret).ok();
        }
        if !self.request_ids.lock().unwrap().insert(request.request_id) {
            debug!(request_id = request.request_id, "duplicate sync request dropped");
            return None;
        }

        let node = self.registry.resolve(from.clone(), request.uid, None);
        node.mark_ok(now_ms);
        if request.rendezvous.is_some() {
            node.set_rendezvous(request.rendezvous.clone());
        }

        let peer_hint = {
            let mut state = self.state.lock().unwrap();
            state.in_this_tick += 1;
            state.family.vote(from.is_ipv6(), now_ms);
            state
                .peer_hint
                .clone()
                .filter(|(uid, _)| *uid != request.uid)
        };

        let snapshot = self.snapshots.get(&self.store, &self.registry, now_ms);
        let mut snapshot = snapshot.lock().unwrap();
        self.selector
            .note_request_from(&node, request.message_count, snapshot.message_count as u32);
        let outcome = compute_reply(
            &self.store,
            &mut snapshot,
            &request,
            &self.config.reconcile,
            self.uid,
            peer_hint,
            |message| self.defense.chain_banned(message.history()),
            now_ms,
        );
        encode(&WireMessage::SyncReply(outcome.reply), &self.secret).ok()
    }

    fn handle_handshake(
        &self,
        from: &Contact,
        handshake: HandshakeMessage,
        now_ms: u64,
    ) -> Option<Vec<u8>> {
        let reply = match handshake {
            HandshakeMessage::Initiate {
                activity,
                kex_public,
            } => match self
                .handshakes
                .handle_initiate(activity, kex_public, &from.address, now_ms)
            {
                Ok(reply) => reply,
                Err(err) => HandshakeMessage::Error {
                    activity,
                    reason: err.to_string(),
                },
            },
            HandshakeMessage::Complete {
                activity,
                identity,
                auth,
            } => match self.handshakes.handle_complete(activity, identity, &auth) {
                Ok((peer, secret)) => {
                    info!(peer = ?peer, "private channel established");
                    self.state.lock().unwrap().peer_secrets.insert(peer, secret);
                    HandshakeMessage::CompleteReply { activity }
                }
                Err(err) => HandshakeMessage::Error {
                    activity,
                    reason: err.to_string(),
                },
            },
            other => {
                debug!(from = %from.address, ?other, "unexpected handshake payload dropped");
                return None;
            }
        };
        encode(&WireMessage::Handshake(reply), &self.secret).ok()
    }

    /// Run the two-round key exchange with `peer`, expecting it to hold the
    /// identity `expected`. On success the pairwise secret is retained and
    /// returned.
    ///
    /// A responder identity other than `expected` aborts the exchange; the
    /// session is discarded rather than downgraded.
    pub async fn establish_private(
        &self,
        peer: &Arc<Node>,
        expected: PublicKey,
    ) -> Result<ChannelSecret> {
        let activity = ActivityId::random();
        let first = self.handshakes.initiate(activity, expected, self.now_ms());
        let (complete, secret) = match self.handshake_call(peer, first).await? {
            HandshakeMessage::InitiateReply {
                activity: echoed,
                kex_public,
                identity,
                auth,
            } if echoed == activity => {
                self.handshakes
                    .handle_initiate_reply(echoed, kex_public, identity, &auth)?
            }
            HandshakeMessage::Error { reason, .. } => {
                return Err(EngineError::HandshakeRefused(reason))
            }
            _ => return Err(EngineError::UnexpectedReply),
        };
        match self.handshake_call(peer, complete).await? {
            HandshakeMessage::CompleteReply { .. } => {
                self.state
                    .lock()
                    .unwrap()
                    .peer_secrets
                    .insert(expected, secret.clone());
                Ok(secret)
            }
            HandshakeMessage::Error { reason, .. } => Err(EngineError::HandshakeRefused(reason)),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    async fn handshake_call(
        &self,
        peer: &Arc<Node>,
        message: HandshakeMessage,
    ) -> Result<HandshakeMessage> {
        let payload = encode(&WireMessage::Handshake(message), &self.secret)?;
        let raw = self
            .transport
            .call(&self.dht_key, &peer.contact(), &payload, CALL_TIMEOUT_MS)
            .await
            .map_err(EngineError::Proto)?;
        match decode(&raw, &self.secret)? {
            WireMessage::Handshake(reply) => Ok(reply),
            _ => Err(EngineError::UnexpectedReply),
        }
    }

    /// The pairwise secret agreed with `peer`, if a handshake completed.
    pub fn private_secret(&self, peer: &PublicKey) -> Option<ChannelSecret> {
        self.state.lock().unwrap().peer_secrets.get(peer).cloned()
    }

    /// Ban the relays carrying a flagged origin's traffic: the fingerprint
    /// common to its pooled chains, or every pooled fingerprint when no
    /// single relay stands out.
    pub fn flag_spammer(&self, origin: &PublicKey) {
        let hops = self.spammers.flag(origin);
        if hops.is_empty() {
            return;
        }
        info!(origin = ?origin, banned = hops.len(), "banning relays for flagged origin");
        self.defense.ban_all(&hops);
        self.spammers.forget(origin);
    }

    /// One outbound sync exchange with `node`.
    async fn sync_once(&self, node: &Arc<Node>, now_ms: u64, wall_ms: i64) -> Result<()> {
        let request = {
            let snapshot = self.snapshots.get(&self.store, &self.registry, now_ms);
            let snapshot = snapshot.lock().unwrap();
            if snapshot.is_degenerate() {
                return Ok(());
            }
            snapshot.make_request(self.uid, self.my_node.rendezvous())
        };
        let payload = encode(&WireMessage::SyncRequest(request), &self.secret)?;

        let raw = match self
            .transport
            .call(&self.dht_key, &node.contact(), &payload, CALL_TIMEOUT_MS)
            .await
        {
            Ok(raw) => raw,
            Err(ProtoError::TransportUninitialized) => return Ok(()),
            Err(err) => {
                node.mark_failed();
                return Err(err.into());
            }
        };
        let reply = match decode(&raw, &self.secret) {
            Ok(WireMessage::SyncReply(reply)) => reply,
            Ok(_) => {
                node.mark_failed();
                return Err(EngineError::UnexpectedReply);
            }
            Err(err) => {
                node.mark_failed();
                return Err(err.into());
            }
        };

        if reply.status == SyncStatus::Loopback {
            debug!(address = %node.address(), "contact loops back to us, demoted");
            self.registry.remove(node, true);
            return Ok(());
        }
        node.mark_ok(now_ms);

        // record provenance once the channel has seen real churn
        let busy = self.store.new_message_count() as usize > self.config.store.max_messages;
        let fresh: Vec<Signature> = reply
            .messages
            .iter()
            .map(|entry| entry.signature)
            .filter(|sig| self.store.get_by_signature(sig).is_none())
            .collect();

        let ctx = ApplyContext {
            store: &self.store,
            registry: &self.registry,
            defense: &self.defense,
            relay: node,
            busy,
            local_key: Some(self.keypair.public_key()),
        };
        let outcome = apply_entries(&ctx, &reply.messages, now_ms, wall_ms);

        for entry in &reply.messages {
            let origin = self
                .registry
                .nodes_for(&entry.uid)
                .iter()
                .find_map(|n| n.public_key());
            if let Some(origin) = origin {
                self.spammers.record(origin, &entry.history);
            }
        }

        for sig in fresh {
            if let Some(message) = self.store.get_by_signature(&sig) {
                self.emit(&message);
            }
        }

        self.selector.note_reply(node, reply.more, outcome.received);
        if let Some((uid, contact)) = reply.peer_hint {
            if uid != self.uid {
                self.registry.resolve(contact, uid, None);
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.out_this_tick += 1;
            state.pending_in = u64::from(reply.more);
        }
        debug!(
            node = ?node.uid(),
            received = outcome.received,
            accepted = outcome.accepted,
            own_echoes = outcome.own_echoes,
            more = reply.more,
            "sync completed"
        );
        Ok(())
    }

    async fn run_sync(
        self: Arc<Self>,
        node: Arc<Node>,
        now_ms: u64,
        wall_ms: i64,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        if let Err(err) = self.sync_once(&node, now_ms, wall_ms).await {
            debug!(node = ?node.uid(), %err, "sync failed");
        }
        self.selector.end(&node);
        drop(permit);
    }

    /// One timer tick: housekeeping, then at most one new outbound sync.
    pub async fn tick(self: &Arc<Self>, now_ms: u64, wall_ms: i64) {
        let (tick, minute_boundary) = {
            let mut state = self.state.lock().unwrap();
            state.tick_count += 1;
            let inbound = state.in_this_tick as f64;
            let outbound = state.out_this_tick as f64;
            state.in_this_tick = 0;
            state.out_this_tick = 0;
            state.in_avg.update(inbound);
            state.out_avg.update(outbound);
            let ticks_per_minute = (60_000 / self.config.tick_ms.max(1)).max(1);
            (state.tick_count, state.tick_count % ticks_per_minute == 0)
        };

        self.ensure_transport_ready(tick).await;

        if minute_boundary {
            self.handshakes.gc(now_ms);
            self.selector.clear_bias_claims();
            self.defense.tick_minute();
        }
        self.defense.gc(now_ms);

        self.annotate_undelivered(now_ms);
        self.apply_family_hint(now_ms);
        self.refresh_peer_hint();
        self.prune_registry();
        self.persist_if_dirty(now_ms, wall_ms);

        // lingering teardown still syncs so peers can pull the backlog
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let idle_ms = self
            .store
            .newest_timestamp_ms()
            .map(|ts| (wall_ms - ts).max(0) as u64)
            .unwrap_or(0);
        if tick % u64::from(cadence_multiplier(idle_ms)) != 0 {
            return;
        }
        self.schedule_sync(now_ms, wall_ms);
    }

    /// Drive ticks from real clocks until destroyed.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            self.tick(self.now_ms(), self.wall_ms()).await;
        }
    }

    /// Register the inbound handler and announce membership once the
    /// overlay is up; re-announce periodically and look for peers while the
    /// registry is sparse.
    async fn ensure_transport_ready(self: &Arc<Self>, tick: u64) {
        if !self.transport.is_initialized() {
            return;
        }
        let register = !self.state.lock().unwrap().handler_registered;
        if register {
            let handler: Arc<dyn RequestHandler> = Arc::new(InboundHandler {
                engine: Arc::downgrade(self),
            });
            match self.transport.register_handler(&self.dht_key, handler) {
                Ok(()) => {
                    self.state.lock().unwrap().handler_registered = true;
                    self.announce().await;
                    self.discover_peers().await;
                    return;
                }
                Err(err) => {
                    debug!(%err, "handler registration deferred");
                    return;
                }
            }
        }
        if tick % ANNOUNCE_EVERY_TICKS == 0 {
            self.announce().await;
        }
        if self.registry.len() <= limits::MIN_NODES {
            self.discover_peers().await;
        }
    }

    async fn announce(&self) {
        if let Err(err) = self.transport.put(&self.dht_key, self.uid.as_bytes()).await {
            debug!(%err, "channel announce deferred");
        }
    }

    async fn discover_peers(&self) {
        let hits = match self
            .transport
            .get(&self.dht_key, limits::MAX_NODES, LOOKUP_TIMEOUT_MS)
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                debug!(%err, "peer lookup failed");
                return;
            }
        };
        let local = self.transport.local_contact();
        for (contact, value) in hits {
            if contact.address == local.address {
                continue;
            }
            let Ok(bytes) = <[u8; 8]>::try_from(value.as_slice()) else {
                continue;
            };
            let uid = NodeUid::from_bytes(bytes);
            if uid == self.uid && !cfg!(feature = "loopback-test") {
                continue;
            }
            self.registry.resolve(contact, uid, None);
        }
    }

    fn annotate_undelivered(&self, now_ms: u64) {
        for message in self.store.messages() {
            if !Arc::ptr_eq(message.node(), &self.my_node) || message.is_local_notice() {
                continue;
            }
            if message.delivery_count() == 0
                && message.age_secs(now_ms) >= UNDELIVERED_ANNOTATE_SECS
                && message.local_annotation().is_none()
            {
                message.set_local_annotation("not yet delivered to any peer");
            }
        }
    }

    fn apply_family_hint(&self, now_ms: u64) {
        let hint = self.state.lock().unwrap().family.hint(now_ms);
        let Some(prefer_v6) = hint else { return };
        for node in self.registry.all() {
            node.apply_ipv6_hint(prefer_v6);
        }
    }

    fn refresh_peer_hint(&self) {
        let hint = self
            .registry
            .random_liveish()
            .filter(|n| !Arc::ptr_eq(n, &self.my_node))
            .map(|n| (n.uid(), n.contact()));
        self.state.lock().unwrap().peer_hint = hint;
    }

    fn prune_registry(&self) {
        let secrets: Vec<PublicKey> = {
            let state = self.state.lock().unwrap();
            state.peer_secrets.keys().copied().collect()
        };
        let mut exempt = vec![Arc::clone(&self.my_node)];
        for node in self.registry.all() {
            if let Some(key) = node.public_key() {
                if secrets.contains(&key) {
                    exempt.push(node);
                }
            }
        }
        let dropped = self.registry.prune(&exempt);
        if dropped > 0 {
            debug!(dropped, "pruned node registry");
        }
    }

    fn persist_if_dirty(&self, now_ms: u64, wall_ms: i64) {
        let Some(path) = &self.config.persist_path else {
            return;
        };
        let mutation = self.store.mutation_count();
        if self.state.lock().unwrap().last_saved_mutation == mutation {
            return;
        }
        let persisted = PersistedState::capture(&self.store, now_ms, wall_ms, |content| {
            self.secret.seal(content).unwrap_or_else(|_| Vec::new())
        });
        match persisted.save_to(path) {
            Ok(()) => {
                self.state.lock().unwrap().last_saved_mutation = mutation;
            }
            Err(err) => warn!(%err, "failed to persist channel state"),
        }
    }

    fn restore_persisted(&self, now_ms: u64, wall_ms: i64) {
        let Some(path) = &self.config.persist_path else {
            return;
        };
        if !path.exists() {
            return;
        }
        match PersistedState::load_from(path) {
            Ok(persisted) => {
                let restored = persisted.restore(
                    &self.registry,
                    &self.store,
                    now_ms,
                    wall_ms,
                    |blob| self.secret.open(blob).ok(),
                );
                info!(restored, "channel state restored");
                self.state.lock().unwrap().last_saved_mutation = self.store.mutation_count();
            }
            Err(err) => warn!(%err, "failed to load persisted channel state"),
        }
    }

    fn schedule_sync(self: &Arc<Self>, now_ms: u64, wall_ms: i64) {
        let candidates: Vec<Arc<Node>> = self
            .registry
            .all()
            .into_iter()
            .filter(|n| !Arc::ptr_eq(n, &self.my_node))
            .collect();
        let Some(node) = self.selector.select(&candidates) else {
            return;
        };
        if !self.selector.begin(&node) {
            return;
        }
        let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
            debug!("worker pool saturated, sync skipped");
            self.selector.end(&node);
            return;
        };
        tokio::spawn(Arc::clone(self).run_sync(node, now_ms, wall_ms, permit));
    }

    fn undelivered_own(&self) -> usize {
        self.store
            .messages()
            .iter()
            .filter(|m| {
                Arc::ptr_eq(m.node(), &self.my_node)
                    && !m.is_local_notice()
                    && m.delivery_count() == 0
            })
            .count()
    }

    /// Leave the channel. Lingers up to the configured grace period while
    /// own messages remain undelivered, then unregisters and saves.
    ///
    /// New sends are refused as soon as teardown begins, but ticks keep
    /// scheduling outbound syncs through the grace period so peers learn of
    /// us and pull the backlog.
    pub async fn destroy(&self) {
        self.destroying.store(true, Ordering::SeqCst);
        let deadline = self.now_ms() + self.config.linger_ms;
        while self.now_ms() < deadline && self.undelivered_own() > 0 {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.transport.unregister_handler(&self.dht_key);
        self.persist_if_dirty(self.now_ms(), self.wall_ms());
        self.listeners.lock().unwrap().clear();
        info!(channel = %self.config.channel_name, "channel destroyed");
    }
}

/// Weak-backed inbound handler, so a registered handler never keeps a
/// destroyed engine alive.
struct InboundHandler {
    engine: Weak<SyncEngine>,
}

#[async_trait]
impl RequestHandler for InboundHandler {
    async fn handle_request(&self, from: &Contact, payload: &[u8]) -> Option<Vec<u8>> {
        let engine = self.engine.upgrade()?;
        let now_ms = engine.now_ms();
        engine.handle_payload(from, payload, now_ms)
    }
}
