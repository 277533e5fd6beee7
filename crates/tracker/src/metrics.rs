//! Best-effort pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the realtime pipeline. Failures are counted here and logged;
/// they never propagate to the event producer.
#[derive(Debug, Default)]
pub struct TrackerMetrics {
    pub events_received: AtomicU64,
    pub events_matched: AtomicU64,
    pub state_updates: AtomicU64,
    pub cache_invalidations: AtomicU64,
    pub failures: AtomicU64,
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_matched: self.events_matched.load(Ordering::Relaxed),
            state_updates: self.state_updates.load(Ordering::Relaxed),
            cache_invalidations: self.cache_invalidations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    pub events_received: u64,
    pub events_matched: u64,
    pub state_updates: u64,
    pub cache_invalidations: u64,
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = TrackerMetrics::new();
        TrackerMetrics::incr(&metrics.events_received);
        TrackerMetrics::incr(&metrics.events_received);
        TrackerMetrics::incr(&metrics.failures);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.state_updates, 0);
    }
}
