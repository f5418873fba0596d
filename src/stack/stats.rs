//! Stack event counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic stack statistics
#[derive(Debug, Default)]
pub struct StackStats {
    /// Stream connections accepted
    streams_accepted: AtomicU64,
    /// Accepts rejected (duplicate identity, engine refusal, shutdown)
    streams_rejected: AtomicU64,
    /// Datagram flows created
    flows_created: AtomicU64,
    /// Datagram flows reclaimed by the idle sweep
    flows_expired: AtomicU64,
    /// Packets forwarded to the output channel
    output_packets: AtomicU64,
    /// Packets dropped because the output channel was full or closed
    output_dropped: AtomicU64,
}

impl StackStats {
    /// Create zeroed statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted stream
    pub fn record_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rejected accept
    pub fn record_rejected(&self) {
        self.streams_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a new datagram flow
    pub fn record_flow_created(&self) {
        self.flows_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record flows reclaimed by the idle sweep
    pub fn record_flows_expired(&self, count: u64) {
        self.flows_expired.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a forwarded output packet
    pub fn record_output(&self) {
        self.output_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped output packet
    pub fn record_output_dropped(&self) {
        self.output_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of all statistics
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            streams_accepted: self.streams_accepted.load(Ordering::Relaxed),
            streams_rejected: self.streams_rejected.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_expired: self.flows_expired.load(Ordering::Relaxed),
            output_packets: self.output_packets.load(Ordering::Relaxed),
            output_dropped: self.output_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Serializable statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Stream connections accepted
    pub streams_accepted: u64,
    /// Accepts rejected
    pub streams_rejected: u64,
    /// Datagram flows created
    pub flows_created: u64,
    /// Datagram flows reclaimed by the idle sweep
    pub flows_expired: u64,
    /// Packets forwarded to the output channel
    pub output_packets: u64,
    /// Packets dropped on a full or closed output channel
    pub output_dropped: u64,
}
