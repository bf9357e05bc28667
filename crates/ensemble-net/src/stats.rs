//! Bandwidth accounting: bytes and messages sent/received per measurement
//! period, with a per-message-kind breakdown.
//!
//! Counters are bumped from both the tick thread (sends) and the transport
//! callback thread (receives), so the totals are atomics and the breakdown
//! sits behind a mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::messages::MessageKind;

// ---------------------------------------------------------------------------
// NetworkCounters
// ---------------------------------------------------------------------------

/// Live totals incremented by the session's send and receive paths.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    /// Wire bytes sent.
    pub bytes_sent: AtomicU64,
    /// Wire bytes received.
    pub bytes_received: AtomicU64,
    /// Packets sent (a broadcast counts once).
    pub messages_sent: AtomicU64,
    /// Packets received.
    pub messages_received: AtomicU64,
    /// Sends the transport refused.
    pub send_failures: AtomicU64,
    /// Received packets that failed to decode.
    pub decode_failures: AtomicU64,
}

impl NetworkCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing packet.
    pub fn record_send(&self, wire_bytes: u64) {
        self.bytes_sent.fetch_add(wire_bytes, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an incoming packet.
    pub fn record_receive(&self, wire_bytes: u64) {
        self.bytes_received.fetch_add(wire_bytes, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send the transport did not accept.
    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet that could not be decoded.
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset all counters (swap with 0).
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            messages_sent: self.messages_sent.swap(0, Ordering::Relaxed),
            messages_received: self.messages_received.swap(0, Ordering::Relaxed),
            send_failures: self.send_failures.swap(0, Ordering::Relaxed),
            decode_failures: self.decode_failures.swap(0, Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`NetworkCounters`] for one measurement period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Wire bytes sent.
    pub bytes_sent: u64,
    /// Wire bytes received.
    pub bytes_received: u64,
    /// Packets sent.
    pub messages_sent: u64,
    /// Packets received.
    pub messages_received: u64,
    /// Sends the transport refused.
    pub send_failures: u64,
    /// Received packets that failed to decode.
    pub decode_failures: u64,
}

// ---------------------------------------------------------------------------
// PerKindCounters
// ---------------------------------------------------------------------------

/// Accumulated count and byte total for a single message kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageKindStats {
    /// Number of packets of this kind.
    pub count: u64,
    /// Total wire bytes across those packets.
    pub total_bytes: u64,
}

/// Per-message-kind byte and count tracking.
#[derive(Debug, Default)]
pub struct PerKindCounters {
    inner: Mutex<HashMap<MessageKind, MessageKindStats>>,
}

impl PerKindCounters {
    /// Create empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one packet of `kind` with the given wire size.
    pub fn record(&self, kind: MessageKind, bytes: u64) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(kind).or_default();
        entry.count += 1;
        entry.total_bytes += bytes;
    }

    /// Snapshot and reset all per-kind counters.
    pub fn snapshot_and_reset(&self) -> HashMap<MessageKind, MessageKindStats> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *map)
    }
}

// ---------------------------------------------------------------------------
// NetworkStats
// ---------------------------------------------------------------------------

/// Statistics for the most recently completed measurement period.
#[derive(Debug, Clone)]
pub struct NetworkStats {
    /// Totals for the period.
    pub current: StatsSnapshot,
    /// Per-kind breakdown for the period.
    pub per_kind: HashMap<MessageKind, MessageKindStats>,
    /// Bytes per period above which a warning is logged.
    pub warning_threshold: u64,
}

impl NetworkStats {
    /// Create empty stats with the given warning threshold.
    pub fn new(warning_threshold: u64) -> Self {
        Self {
            current: StatsSnapshot::default(),
            per_kind: HashMap::new(),
            warning_threshold,
        }
    }

    /// Move the live counters into this period's stats, resetting them.
    /// Returns `true` if the period exceeded the bandwidth threshold.
    pub fn roll_period(&mut self, counters: &NetworkCounters, per_kind: &PerKindCounters) -> bool {
        self.current = counters.snapshot_and_reset();
        self.per_kind = per_kind.snapshot_and_reset();

        let total_bytes = self.current.bytes_sent + self.current.bytes_received;
        if total_bytes > self.warning_threshold {
            tracing::warn!(
                total_bytes,
                threshold = self.warning_threshold,
                "bandwidth threshold exceeded"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_reset() {
        let counters = NetworkCounters::new();
        counters.record_send(100);
        counters.record_send(50);
        counters.record_receive(30);
        counters.record_send_failure();

        let snap = counters.snapshot_and_reset();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_received, 30);
        assert_eq!(snap.send_failures, 1);

        assert_eq!(counters.snapshot_and_reset(), StatsSnapshot::default());
    }

    #[test]
    fn test_per_kind_breakdown() {
        let per_kind = PerKindCounters::new();
        per_kind.record(MessageKind::PositionUpdate, 40);
        per_kind.record(MessageKind::PositionUpdate, 44);
        per_kind.record(MessageKind::MapSync, 12);

        let map = per_kind.snapshot_and_reset();
        assert_eq!(map[&MessageKind::PositionUpdate].count, 2);
        assert_eq!(map[&MessageKind::PositionUpdate].total_bytes, 84);
        assert_eq!(map[&MessageKind::MapSync].count, 1);
        assert!(per_kind.snapshot_and_reset().is_empty());
    }

    #[test]
    fn test_roll_period_flags_threshold() {
        let counters = NetworkCounters::new();
        let per_kind = PerKindCounters::new();
        let mut stats = NetworkStats::new(100);

        counters.record_send(60);
        assert!(!stats.roll_period(&counters, &per_kind));

        counters.record_send(60);
        counters.record_receive(60);
        assert!(stats.roll_period(&counters, &per_kind));
        assert_eq!(stats.current.bytes_sent, 60);
    }
}
