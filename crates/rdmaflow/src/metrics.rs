//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of a context's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Progress polls run.
    pub polls: u64,
    /// Tasks handed to the engine, resubmissions included.
    pub tasks_submitted: u64,
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Tasks completed with an error.
    pub tasks_failed: u64,
    /// Payload bytes moved by send-side tasks.
    pub bytes_sent: u64,
    /// Payload bytes landed by receive tasks.
    pub bytes_received: u64,
    /// Handshakes that completed.
    pub connections_established: u64,
    /// Handshakes that failed, rejections and timeouts included.
    pub connections_failed: u64,
    /// Connections that went down after connecting.
    pub connections_disconnected: u64,
}

/// Lock-free counters updated by the progress engine.
#[derive(Default)]
pub(crate) struct EngineMetrics {
    polls: AtomicU64,
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    connections_established: AtomicU64,
    connections_failed: AtomicU64,
    connections_disconnected: AtomicU64,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_polls(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_tasks_submitted(&self) {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a completion as succeeded or failed.
    pub fn record_completion(&self, ok: bool) {
        if ok {
            self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_connections_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_failed(&self) {
        self.connections_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_disconnected(&self) {
        self.connections_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            tasks_submitted: self.tasks_submitted.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_disconnected: self.connections_disconnected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_zero() {
        assert_eq!(EngineMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new();
        metrics.inc_polls();
        metrics.inc_polls();
        metrics.inc_tasks_submitted();
        metrics.record_completion(true);
        metrics.record_completion(false);
        metrics.add_bytes_sent(100);
        metrics.add_bytes_received(40);
        metrics.inc_connections_established();
        metrics.inc_connections_failed();
        metrics.inc_connections_disconnected();

        let snap = metrics.snapshot();
        assert_eq!(snap.polls, 2);
        assert_eq!(snap.tasks_submitted, 1);
        assert_eq!(snap.tasks_completed, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 40);
        assert_eq!(snap.connections_established, 1);
        assert_eq!(snap.connections_failed, 1);
        assert_eq!(snap.connections_disconnected, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = EngineMetrics::new();
        metrics.add_bytes_sent(7);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"bytes_sent\":7"));
    }
}
