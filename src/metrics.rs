//! Metrics collection for the routing core
//!
//! Atomics-based counters grouped by concern, with a snapshot view for
//! embedding processes that want to export them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector for one router instance
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub writes: WriteMetrics,
    pub persistence: PersistenceMetrics,
    pub actuation: ActuationMetrics,
    pub control: ControlMetrics,
}

/// Write-path metrics
#[derive(Debug, Default)]
pub struct WriteMetrics {
    pub submitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub buffered_local: AtomicU64,
}

/// Disk-log metrics
#[derive(Debug, Default)]
pub struct PersistenceMetrics {
    pub records_persisted: AtomicU64,
    pub records_replayed: AtomicU64,
}

/// Actuation metrics
#[derive(Debug, Default)]
pub struct ActuationMetrics {
    pub batches_published: AtomicU64,
    pub packets_dropped: AtomicU64,
}

/// Control-channel metrics
#[derive(Debug, Default)]
pub struct ControlMetrics {
    pub messages_applied: AtomicU64,
    pub messages_ignored: AtomicU64,
    pub listener_respawns: AtomicU64,
}

/// Point-in-time view of all counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub writes_submitted: u64,
    pub writes_succeeded: u64,
    pub writes_failed: u64,
    pub writes_retried: u64,
    pub writes_buffered_local: u64,
    pub records_persisted: u64,
    pub records_replayed: u64,
    pub actuation_batches_published: u64,
    pub actuation_packets_dropped: u64,
    pub control_messages_applied: u64,
    pub control_messages_ignored: u64,
    pub listener_respawns: u64,
}

impl RouterMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a consistent-enough snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            writes_submitted: self.writes.submitted.load(Ordering::Relaxed),
            writes_succeeded: self.writes.succeeded.load(Ordering::Relaxed),
            writes_failed: self.writes.failed.load(Ordering::Relaxed),
            writes_retried: self.writes.retried.load(Ordering::Relaxed),
            writes_buffered_local: self.writes.buffered_local.load(Ordering::Relaxed),
            records_persisted: self.persistence.records_persisted.load(Ordering::Relaxed),
            records_replayed: self.persistence.records_replayed.load(Ordering::Relaxed),
            actuation_batches_published: self.actuation.batches_published.load(Ordering::Relaxed),
            actuation_packets_dropped: self.actuation.packets_dropped.load(Ordering::Relaxed),
            control_messages_applied: self.control.messages_applied.load(Ordering::Relaxed),
            control_messages_ignored: self.control.messages_ignored.load(Ordering::Relaxed),
            listener_respawns: self.control.listener_respawns.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn incr_by(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
