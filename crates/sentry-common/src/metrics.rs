//! Lock-free counters for the stats task.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter, read with relaxed ordering by the
/// 5-second stats task.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Start the counter at `value`.
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment by one.
    #[inline]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add an arbitrary delta.
    #[inline]
    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed)
    }

    /// Subtract an arbitrary delta, saturating at zero.
    #[inline]
    pub fn sub(&self, delta: u64) -> u64 {
        self.0.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(delta)))
            .unwrap_or(0)
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The three pipeline-wide counters from spec.md §4.11: packets handed to a
/// worker, packets dropped (channel full / decode failure), and connections
/// fully processed by a worker.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Packets read from a capture source.
    pub received: AtomicCounter,
    /// Packets or connections dropped (channel full, decode failure).
    pub dropped: AtomicCounter,
    /// Connections that completed the analyzer pipeline.
    pub processed: AtomicCounter,
}

impl PipelineStats {
    /// Snapshot of the three counters at this instant.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (self.received.get(), self.dropped.get(), self.processed.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let c = AtomicCounter::new(0);
        assert_eq!(c.inc(), 0);
        assert_eq!(c.inc(), 1);
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn stats_snapshot_reads_all_three() {
        let stats = PipelineStats::default();
        stats.received.add(10);
        stats.dropped.add(1);
        stats.processed.add(9);
        assert_eq!(stats.snapshot(), (10, 1, 9));
    }
}
