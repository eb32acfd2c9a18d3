//! Sync coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct SyncMetrics {
    connects: AtomicU64,
    connect_us: AtomicU64,
    disconnects: AtomicU64,
    disconnect_us: AtomicU64,
    rebuilds: AtomicU64,
    rebuild_us: AtomicU64,
    corruption_events: AtomicU64,
}

#[derive(Clone, Debug, Default)]
pub struct SyncMetricsSnapshot {
    pub connects: u64,
    pub connect_us: u64,
    pub disconnects: u64,
    pub disconnect_us: u64,
    pub rebuilds: u64,
    pub rebuild_us: u64,
    pub corruption_events: u64,
}

impl SyncMetrics {
    pub fn record_connect(&self, elapsed: Duration) {
        self.connect_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self, elapsed: Duration) {
        self.disconnect_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self, elapsed: Duration) {
        self.rebuild_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corruption(&self) {
        self.corruption_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            connect_us: self.connect_us.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            disconnect_us: self.disconnect_us.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            rebuild_us: self.rebuild_us.load(Ordering::Relaxed),
            corruption_events: self.corruption_events.load(Ordering::Relaxed),
        }
    }
}
