//! Windowed tracker counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::events::StatsEvent;

#[derive(Debug, Default)]
pub struct TrackerStats {
    scheduled: AtomicU64,
    fired: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
    persisted: AtomicU64,
    rejected: AtomicU64,
}

impl TrackerStats {
    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fired(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values without resetting.
    pub fn snapshot(&self, window_ms: u64) -> StatsEvent {
        StatsEvent {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            fired: self.fired.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            window_ms,
        }
    }

    /// Take the current window's values and start a new window.
    pub fn snapshot_and_reset(&self, window_ms: u64) -> StatsEvent {
        StatsEvent {
            scheduled: self.scheduled.swap(0, Ordering::Relaxed),
            fired: self.fired.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
            stale: self.stale.swap(0, Ordering::Relaxed),
            persisted: self.persisted.swap(0, Ordering::Relaxed),
            rejected: self.rejected.swap(0, Ordering::Relaxed),
            window_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_starts_new_window() {
        let stats = TrackerStats::default();
        stats.record_scheduled();
        stats.record_scheduled();
        stats.record_skipped();
        stats.record_rejected();

        let window = stats.snapshot_and_reset(1_000);
        assert_eq!(window.scheduled, 2);
        assert_eq!(window.skipped, 1);
        assert_eq!(window.rejected, 1);
        assert_eq!(window.window_ms, 1_000);

        assert_eq!(stats.snapshot(0), StatsEvent::default());
    }
}
