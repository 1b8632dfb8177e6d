//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of an engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Number of entries created.
    pub entries: u64,
    /// Reads served inside the staleness window.
    pub fresh_reads: u64,
    /// Reads made after the staleness window elapsed (or before any fetch).
    pub stale_reads: u64,
    /// Remote fetches that completed successfully.
    pub remote_fetches: u64,
    /// Remote fetches that failed.
    pub remote_fetch_failures: u64,
    /// Fetch results dropped because local state changed meanwhile.
    pub discarded_fetches: u64,
    /// Remote pushes that completed successfully.
    pub remote_pushes: u64,
    /// Remote pushes that failed.
    pub remote_push_failures: u64,
    /// Local store writes that failed.
    pub local_write_failures: u64,
    /// Values applied from another tab's write.
    pub cross_tab_applies: u64,
}

impl EngineStats {
    /// Fraction of reads served without needing a remote refresh (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.fresh_reads + self.stale_reads;
        if total == 0 {
            0.0
        } else {
            self.fresh_reads as f64 / total as f64
        }
    }
}

/// Live counters behind [`EngineStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) entries: AtomicU64,
    pub(crate) fresh_reads: AtomicU64,
    pub(crate) stale_reads: AtomicU64,
    pub(crate) remote_fetches: AtomicU64,
    pub(crate) remote_fetch_failures: AtomicU64,
    pub(crate) discarded_fetches: AtomicU64,
    pub(crate) remote_pushes: AtomicU64,
    pub(crate) remote_push_failures: AtomicU64,
    pub(crate) local_write_failures: AtomicU64,
    pub(crate) cross_tab_applies: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStats {
            entries: load(&self.entries),
            fresh_reads: load(&self.fresh_reads),
            stale_reads: load(&self.stale_reads),
            remote_fetches: load(&self.remote_fetches),
            remote_fetch_failures: load(&self.remote_fetch_failures),
            discarded_fetches: load(&self.discarded_fetches),
            remote_pushes: load(&self.remote_pushes),
            remote_push_failures: load(&self.remote_push_failures),
            local_write_failures: load(&self.local_write_failures),
            cross_tab_applies: load(&self.cross_tab_applies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = EngineStats {
            fresh_reads: 3,
            stale_reads: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(EngineStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let counters = StatsCounters::default();
        StatsCounters::incr(&counters.remote_fetches);
        StatsCounters::incr(&counters.remote_fetches);
        StatsCounters::incr(&counters.cross_tab_applies);

        let stats = counters.snapshot();
        assert_eq!(stats.remote_fetches, 2);
        assert_eq!(stats.cross_tab_applies, 1);
        assert_eq!(stats.remote_pushes, 0);
    }
}
