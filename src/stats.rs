//! Per-session counters and their process-wide registry
//!
//! Counters are plain atomics updated from splicers and supervisors;
//! snapshots are point-in-time copies. The registry is an instance-scoped
//! object handed to collaborators, not a singleton.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Live counters for one session. Cheap to share; every mutation is a
/// single atomic add.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub failed_connections: AtomicU64,
    pub rejected_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnect_count: AtomicU64,
    /// Unix millis of the last byte moved; 0 means never.
    last_activity_ms: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bracket one accepted connection: call on accept...
    pub fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// ...and exactly once when its handler returns.
    pub fn connection_closed(&self) {
        let prev = self.active_connections.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "active_connections underflow");
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy.
    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            failed_connections: self.failed_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_activity_at: (last_ms > 0)
                .then(|| DateTime::from_timestamp_millis(last_ms as i64))
                .flatten(),
        }
    }
}

/// Serializable copy of [`SessionStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub failed_connections: u64,
    pub rejected_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// All sessions' counters, keyed by session id.
#[derive(Default)]
pub struct StatsRegistry {
    sessions: DashMap<String, Arc<SessionStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the counters for `session_id`.
    pub fn register(&self, session_id: &str) -> Arc<SessionStats> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionStats::new)
            .clone()
    }

    pub fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionStats>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Point-in-time copy of every session's counters.
    pub fn snapshot_all(&self) -> HashMap<String, StatsSnapshot> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect()
    }

    /// Totals across all sessions.
    pub fn aggregate(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for entry in self.sessions.iter() {
            let s = entry.value().snapshot();
            total.total_connections += s.total_connections;
            total.active_connections += s.active_connections;
            total.failed_connections += s.failed_connections;
            total.rejected_connections += s.rejected_connections;
            total.bytes_sent += s.bytes_sent;
            total.bytes_received += s.bytes_received;
            total.reconnect_count += s.reconnect_count;
            total.last_activity_at = match (total.last_activity_at, s.last_activity_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_close_brackets_active_count() {
        let stats = SessionStats::new();
        stats.connection_opened();
        stats.connection_opened();
        assert_eq!(stats.active(), 2);
        stats.connection_closed();
        assert_eq!(stats.active(), 1);
        assert_eq!(stats.snapshot().total_connections, 2);
    }

    #[test]
    fn byte_counters_are_monotonic_and_touch_activity() {
        let stats = SessionStats::new();
        assert!(stats.snapshot().last_activity_at.is_none());
        stats.add_bytes_sent(100);
        stats.add_bytes_received(50);
        stats.add_bytes_sent(1);
        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 101);
        assert_eq!(snap.bytes_received, 50);
        assert!(snap.last_activity_at.is_some());
    }

    #[test]
    fn registry_registers_and_aggregates() {
        let registry = StatsRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        a.add_bytes_sent(10);
        b.add_bytes_sent(5);
        b.connection_opened();

        let all = registry.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"].bytes_sent, 10);

        let total = registry.aggregate();
        assert_eq!(total.bytes_sent, 15);
        assert_eq!(total.active_connections, 1);

        registry.unregister("a");
        assert!(registry.get("a").is_none());
        // Holders keep their Arc after unregistration.
        a.add_bytes_sent(1);
    }

    #[test]
    fn register_is_idempotent() {
        let registry = StatsRegistry::new();
        let first = registry.register("s");
        first.add_bytes_sent(7);
        let second = registry.register("s");
        assert_eq!(second.snapshot().bytes_sent, 7);
    }
}
