//! Observable engine counters.

use meshsync_store::NodeCounts;

/// A point-in-time view of the engine's health.
#[derive(Debug, Clone, Default)]
pub struct EngineCounters {
    /// Live messages retained.
    pub message_count: usize,
    /// Own messages never yet handed to a peer.
    pub undelivered_out: usize,
    /// Backlog peers reported holding for us (sum of recent `more`
    /// counters).
    pub pending_in: u64,
    /// Node registry breakdown.
    pub nodes: NodeCounts,
    /// Moving average of inbound sync requests per tick.
    pub in_requests_per_tick: f64,
    /// Moving average of outbound sync requests per tick.
    pub out_requests_per_tick: f64,
    /// Rough live-peer population estimate.
    pub estimated_live_peers: usize,
    /// Banned relay fingerprints.
    pub banned_fingerprints: usize,
}
