//! Flood and spam defense built on message provenance chains.
//!
//! Every relayed message carries a chain of 4-byte hop fingerprints,
//! newest first. A fingerprint that keeps reappearing gets a watch entry;
//! a watched fingerprint whose sighting rate crosses the per-minute or
//! per-two-minute threshold is banned, together with every fingerprint
//! that relayed its traffic onward (the newer hops in the offending
//! chain). Bans are permanent until explicitly reset.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tracing::{debug, warn};

use meshsync_core::{history_hops, CountingBloomFilter, HopId, PublicKey, RollingRate};

/// Thresholds for the chain watch machinery.
#[derive(Debug, Clone)]
pub struct DefenseConfig {
    /// Sightings through the repeat bloom before a watch entry starts.
    pub repeat_threshold: u8,
    /// Sightings per short window that trigger a ban.
    pub short_limit: usize,
    /// Short window, milliseconds.
    pub short_window_ms: u64,
    /// Sightings per long window that trigger a ban.
    pub long_limit: usize,
    /// Long window, milliseconds.
    pub long_window_ms: u64,
    /// A watch this quiet, and under half threshold, is dropped.
    pub quiet_ms: u64,
    /// Chains pooled per flagged origin key.
    pub spammer_pool: usize,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            repeat_threshold: 5,
            short_limit: 30,
            short_window_ms: 60_000,
            long_limit: 50,
            long_window_ms: 120_000,
            quiet_ms: 180_000,
            spammer_pool: 16,
        }
    }
}

struct Watch {
    short: RollingRate,
    long: RollingRate,
    last_hit_ms: u64,
}

struct DefenseInner {
    /// Repeat detector, cleared every minute.
    repeats: CountingBloomFilter,
    watches: HashMap<HopId, Watch>,
    banned: HashSet<HopId>,
}

/// Watches provenance chains and bans flooding relays.
pub struct HistoryDefense {
    config: DefenseConfig,
    inner: Mutex<DefenseInner>,
}

impl HistoryDefense {
    /// Create a defense with the given thresholds.
    pub fn new(config: DefenseConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(DefenseInner {
                repeats: CountingBloomFilter::new(2048),
                watches: HashMap::new(),
                banned: HashSet::new(),
            }),
        }
    }

    /// Record a received chain.
    ///
    /// Returns false when the chain touches a banned fingerprint, in which
    /// case the message must be dropped without recording.
    pub fn record_chain(&self, history: &[u8], now_ms: u64) -> bool {
        let hops: Vec<HopId> = history_hops(history).collect();
        let mut inner = self.inner.lock().unwrap();

        if hops.iter().any(|hop| inner.banned.contains(hop)) {
            return false;
        }

        let mut to_ban: Vec<HopId> = Vec::new();
        for (idx, hop) in hops.iter().enumerate() {
            if let Some(watch) = inner.watches.get_mut(hop) {
                watch.last_hit_ms = now_ms;
                let short = watch.short.hit(now_ms);
                let long = watch.long.hit(now_ms);
                if short >= self.config.short_limit || long >= self.config.long_limit {
                    warn!(?hop, short, long, "relay fingerprint crossed flood threshold");
                    // the offender plus everyone who relayed it onward
                    to_ban.push(*hop);
                    to_ban.extend_from_slice(&hops[..idx]);
                }
            } else if inner.repeats.add(hop.as_bytes()) > self.config.repeat_threshold {
                debug!(?hop, "fingerprint repeating, starting watch");
                inner.watches.insert(
                    *hop,
                    Watch {
                        short: RollingRate::new(self.config.short_window_ms),
                        long: RollingRate::new(self.config.long_window_ms),
                        last_hit_ms: now_ms,
                    },
                );
            }
        }

        for hop in to_ban {
            inner.banned.insert(hop);
            inner.watches.remove(&hop);
        }
        true
    }

    /// True when a fingerprint is banned.
    pub fn is_banned(&self, hop: &HopId) -> bool {
        self.inner.lock().unwrap().banned.contains(hop)
    }

    /// True when a chain contains any banned fingerprint.
    pub fn chain_banned(&self, history: &[u8]) -> bool {
        let inner = self.inner.lock().unwrap();
        history_hops(history).any(|hop| inner.banned.contains(&hop))
    }

    /// Ban a set of fingerprints outright (spammer flagging).
    pub fn ban_all(&self, hops: &[HopId]) {
        let mut inner = self.inner.lock().unwrap();
        for hop in hops {
            inner.banned.insert(*hop);
            inner.watches.remove(hop);
        }
    }

    /// Number of banned fingerprints.
    pub fn banned_count(&self) -> usize {
        self.inner.lock().unwrap().banned.len()
    }

    /// Forget every ban and watch.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.banned.clear();
        inner.watches.clear();
        inner.repeats.clear();
    }

    /// Minute cadence: restart repeat detection.
    pub fn tick_minute(&self) {
        self.inner.lock().unwrap().repeats.clear();
    }

    /// Drop watches that have been quiet and stayed under half threshold.
    pub fn gc(&self, now_ms: u64) {
        let quiet_ms = self.config.quiet_ms;
        let half_short = self.config.short_limit / 2;
        let half_long = self.config.long_limit / 2;
        let mut inner = self.inner.lock().unwrap();
        inner.watches.retain(|_, watch| {
            now_ms.saturating_sub(watch.last_hit_ms) < quiet_ms
                || watch.short.count(now_ms) >= half_short
                || watch.long.count(now_ms) >= half_long
        });
    }

    /// Number of active watch entries.
    pub fn watch_count(&self) -> usize {
        self.inner.lock().unwrap().watches.len()
    }
}

impl Default for HistoryDefense {
    fn default() -> Self {
        Self::new(DefenseConfig::default())
    }
}

/// Pools the recent chains of origins flagged as spammers.
///
/// Flagging an origin bans the fingerprint its chains have most in
/// common; when its chains share nothing, every fingerprint it touched
/// goes.
pub struct SpammerLedger {
    pool: usize,
    chains: Mutex<HashMap<PublicKey, VecDeque<Vec<u8>>>>,
}

impl SpammerLedger {
    /// Create a ledger pooling `pool` chains per origin.
    pub fn new(pool: usize) -> Self {
        Self {
            pool,
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Record the chain of a message from `origin`.
    pub fn record(&self, origin: PublicKey, history: &[u8]) {
        if history.is_empty() {
            return;
        }
        let mut chains = self.chains.lock().unwrap();
        let entry = chains.entry(origin).or_default();
        entry.push_back(history.to_vec());
        while entry.len() > self.pool {
            entry.pop_front();
        }
    }

    /// Flag `origin` as a spammer and compute the fingerprints to ban.
    pub fn flag(&self, origin: &PublicKey) -> Vec<HopId> {
        let chains = self.chains.lock().unwrap();
        let Some(pooled) = chains.get(origin) else {
            return Vec::new();
        };

        // how many pooled chains each fingerprint appears in
        let mut frequency: HashMap<HopId, usize> = HashMap::new();
        for chain in pooled {
            let distinct: HashSet<HopId> = history_hops(chain).collect();
            for hop in distinct {
                *frequency.entry(hop).or_insert(0) += 1;
            }
        }
        let max = frequency.values().copied().max().unwrap_or(0);
        if max > 1 {
            frequency
                .into_iter()
                .filter(|(_, count)| *count == max)
                .map(|(hop, _)| hop)
                .collect()
        } else {
            frequency.into_keys().collect()
        }
    }

    /// Drop pooled chains for `origin`.
    pub fn forget(&self, origin: &PublicKey) {
        self.chains.lock().unwrap().remove(origin);
    }
}

impl Default for SpammerLedger {
    fn default() -> Self {
        Self::new(DefenseConfig::default().spammer_pool)
    }
}

/// Decision for one locally-sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendDecision {
    /// Delay to apply before the send.
    pub delay_ms: u64,
    /// Emit the once-per-window flood warning to the user.
    pub warn: bool,
}

/// Sender-side rate limiter: delays grow as the window fills, with a
/// single user-facing warning per window.
pub struct SendRateLimiter {
    limit: usize,
    window: RollingRate,
    last_warn_ms: Option<u64>,
}

impl SendRateLimiter {
    /// Default messages allowed per window.
    pub const DEFAULT_LIMIT: usize = 30;
    /// Window length, milliseconds.
    pub const WINDOW_MS: u64 = 60_000;

    /// Create a limiter allowing `limit` messages per minute.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(4),
            window: RollingRate::new(Self::WINDOW_MS),
            last_warn_ms: None,
        }
    }

    /// Register a send at `now_ms` and get the pacing decision.
    pub fn register(&mut self, now_ms: u64) -> SendDecision {
        let count = self.window.hit(now_ms);

        let delay_ms = if count < self.limit / 4 {
            0
        } else if count < self.limit / 2 {
            1_000
        } else {
            (count as u64 * 1_000) / (self.limit as u64 / 4)
        };

        let mut warn = false;
        if count > self.limit * 3 / 4 {
            let due = self
                .last_warn_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= Self::WINDOW_MS);
            if due {
                self.last_warn_ms = Some(now_ms);
                warn = true;
            }
        }

        SendDecision { delay_ms, warn }
    }
}

impl Default for SendRateLimiter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshsync_core::extend_history;

    fn chain(hops: &[u32]) -> Vec<u8> {
        let mut history = Vec::new();
        // oldest first in the input, so prepend in order
        for hop in hops {
            history = extend_history(&history, HopId::from_bytes(hop.to_le_bytes()));
        }
        history
    }

    fn hop(id: u32) -> HopId {
        HopId::from_bytes(id.to_le_bytes())
    }

    #[test]
    fn test_repeats_start_watch() {
        let defense = HistoryDefense::default();
        let history = chain(&[1]);
        for _ in 0..5 {
            assert!(defense.record_chain(&history, 0));
        }
        assert_eq!(defense.watch_count(), 0);
        defense.record_chain(&history, 0);
        assert_eq!(defense.watch_count(), 1);
    }

    #[test]
    fn test_flood_bans_offender_and_tail_enders() {
        let defense = HistoryDefense::default();
        // chain [newest..oldest] = [3, 2, 1]: hop 1 originated the traffic,
        // hops 2 and 3 relayed it onward
        let history = chain(&[1, 2, 3]);
        let mut now = 0;
        let mut dropped = false;
        for _ in 0..60 {
            if !defense.record_chain(&history, now) {
                dropped = true;
                break;
            }
            now += 500;
        }
        assert!(dropped, "flooding chain should have been banned");
        assert!(defense.is_banned(&hop(1)));
        // the tail-enders that kept relaying it are banned too
        assert!(defense.is_banned(&hop(2)));
        assert!(defense.is_banned(&hop(3)));
    }

    #[test]
    fn test_banned_chain_dropped_without_recording() {
        let defense = HistoryDefense::default();
        defense.ban_all(&[hop(9)]);
        assert!(!defense.record_chain(&chain(&[9, 10]), 0));
        assert!(defense.chain_banned(&chain(&[10, 9])));
        // an untouched chain still passes
        assert!(defense.record_chain(&chain(&[11]), 0));
    }

    #[test]
    fn test_slow_traffic_never_banned() {
        let defense = HistoryDefense::default();
        let history = chain(&[5]);
        let mut now = 0;
        for _ in 0..200 {
            assert!(defense.record_chain(&history, now));
            now += 10_000; // six per minute, well under threshold
        }
        assert!(!defense.is_banned(&hop(5)));
    }

    #[test]
    fn test_gc_drops_quiet_watches() {
        let defense = HistoryDefense::default();
        let history = chain(&[1]);
        for _ in 0..6 {
            defense.record_chain(&history, 0);
        }
        assert_eq!(defense.watch_count(), 1);
        defense.gc(100_000);
        assert_eq!(defense.watch_count(), 1);
        defense.gc(200_000);
        assert_eq!(defense.watch_count(), 0);
    }

    #[test]
    fn test_reset_clears_bans() {
        let defense = HistoryDefense::default();
        defense.ban_all(&[hop(1), hop(2)]);
        assert_eq!(defense.banned_count(), 2);
        defense.reset();
        assert_eq!(defense.banned_count(), 0);
    }

    #[test]
    fn test_spammer_common_fingerprint() {
        let ledger = SpammerLedger::default();
        let origin = meshsync_core::Keypair::generate().public_key();
        // hop 7 relays every chain; the others vary
        ledger.record(origin, &chain(&[7, 1]));
        ledger.record(origin, &chain(&[7, 2]));
        ledger.record(origin, &chain(&[3, 7]));
        let banned = ledger.flag(&origin);
        assert_eq!(banned, vec![hop(7)]);
    }

    #[test]
    fn test_spammer_disjoint_chains_ban_everything() {
        let ledger = SpammerLedger::default();
        let origin = meshsync_core::Keypair::generate().public_key();
        ledger.record(origin, &chain(&[1, 2]));
        ledger.record(origin, &chain(&[3, 4]));
        let mut banned = ledger.flag(&origin);
        banned.sort_by_key(|h| *h.as_bytes());
        assert_eq!(banned.len(), 4);
    }

    #[test]
    fn test_spammer_pool_is_bounded() {
        let ledger = SpammerLedger::new(2);
        let origin = meshsync_core::Keypair::generate().public_key();
        ledger.record(origin, &chain(&[1]));
        ledger.record(origin, &chain(&[2]));
        ledger.record(origin, &chain(&[3]));
        // chain [1] fell out of the pool, so 1 is not among the bans
        let banned = ledger.flag(&origin);
        assert!(!banned.contains(&hop(1)));
    }

    #[test]
    fn test_send_rate_tiers() {
        let mut limiter = SendRateLimiter::new(32);
        // first quarter: free
        for i in 0..7 {
            assert_eq!(limiter.register(i).delay_ms, 0);
        }
        // second quarter: one second
        let decision = limiter.register(8);
        assert_eq!(decision.delay_ms, 1_000);
        assert!(!decision.warn);
        // past half: proportional and growing
        for i in 9..16 {
            limiter.register(i);
        }
        let decision = limiter.register(16);
        assert!(decision.delay_ms > 1_000);
    }

    #[test]
    fn test_single_warning_per_window() {
        let mut limiter = SendRateLimiter::new(8);
        let mut warnings = 0;
        for i in 0..20u64 {
            if limiter.register(i).warn {
                warnings += 1;
            }
        }
        assert_eq!(warnings, 1);
        // a fresh window warns again
        let mut late_warnings = 0;
        for i in 0..20u64 {
            if limiter.register(120_000 + i).warn {
                late_warnings += 1;
            }
        }
        assert_eq!(late_warnings, 1);
    }
}
