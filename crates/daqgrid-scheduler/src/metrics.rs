//! Cycle counters.
//!
//! Counting never fails and never blocks; a metrics problem must not be
//! able to take the scheduler down.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Atomic counters covering the controller and the matcher.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub events_received: AtomicU64,
    pub offers_received: AtomicU64,
    pub offers_declined: AtomicU64,
    pub tasks_launched: AtomicU64,
    pub tasks_finished: AtomicU64,
    pub messages_dropped: AtomicU64,
    /// Gauge: descriptors left unmatched after the last cycle.
    pub descriptors_pending: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_events(&self, n: u64) {
        self.events_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_offers(&self, n: u64) {
        self.offers_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_declined(&self, n: u64) {
        self.offers_declined.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_launched(&self, n: u64) {
        self.tasks_launched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_finished(&self, n: u64) {
        self.tasks_finished.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_message(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pending(&self, n: u64) {
        self.descriptors_pending.store(n, Ordering::Relaxed);
    }

    pub fn pending(&self) -> u64 {
        self.descriptors_pending.load(Ordering::Relaxed)
    }

    /// Per-cycle summary, gated by the `summary_metrics` config flag at
    /// the call site.
    pub fn log_summary(&self) {
        info!(
            events = self.events_received.load(Ordering::Relaxed),
            offers = self.offers_received.load(Ordering::Relaxed),
            declined = self.offers_declined.load(Ordering::Relaxed),
            launched = self.tasks_launched.load(Ordering::Relaxed),
            finished = self.tasks_finished.load(Ordering::Relaxed),
            dropped_messages = self.messages_dropped.load(Ordering::Relaxed),
            "scheduler counters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = SchedulerMetrics::new();
        metrics.add_offers(3);
        metrics.add_offers(2);
        metrics.add_launched(1);
        assert_eq!(metrics.offers_received.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.tasks_launched.load(Ordering::Relaxed), 1);
    }
}
