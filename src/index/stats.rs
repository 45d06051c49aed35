//! Advisory per-call counters, enabled by the `MLFS_PROFILE` environment
//! hook. Relaxed atomics throughout; numbers are statistics, not truth.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct IndexStats {
    enabled: bool,
    lookups: AtomicU64,
    inserts: AtomicU64,
    removes: AtomicU64,
    probe_steps: AtomicU64,
    min_chain: AtomicU64,
    max_chain: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub lookups: u64,
    pub inserts: u64,
    pub removes: u64,
    pub probe_steps: u64,
    /// Shortest probe chain observed; 0 when nothing was recorded.
    pub min_chain: u64,
    pub max_chain: u64,
}

impl IndexStats {
    pub fn new(enabled: bool) -> IndexStats {
        IndexStats {
            enabled,
            lookups: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            probe_steps: AtomicU64::new(0),
            min_chain: AtomicU64::new(u64::MAX),
            max_chain: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_lookup(&self, chain: u64) {
        if !self.enabled {
            return;
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.record_chain(chain);
    }

    #[inline]
    pub fn record_insert(&self, chain: u64) {
        if !self.enabled {
            return;
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.record_chain(chain);
    }

    #[inline]
    pub fn record_remove(&self, chain: u64) {
        if !self.enabled {
            return;
        }
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.record_chain(chain);
    }

    fn record_chain(&self, chain: u64) {
        self.probe_steps.fetch_add(chain, Ordering::Relaxed);
        self.min_chain.fetch_min(chain, Ordering::Relaxed);
        self.max_chain.fetch_max(chain, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let min = self.min_chain.load(Ordering::Relaxed);
        StatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            probe_steps: self.probe_steps.load(Ordering::Relaxed),
            min_chain: if min == u64::MAX { 0 } else { min },
            max_chain: self.max_chain.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_stats_record_nothing() {
        let s = IndexStats::new(false);
        s.record_lookup(3);
        s.record_insert(2);
        assert_eq!(s.snapshot().lookups, 0);
        assert_eq!(s.snapshot().probe_steps, 0);
    }

    #[test]
    fn enabled_stats_track_chain_extremes() {
        let s = IndexStats::new(true);
        s.record_lookup(3);
        s.record_lookup(9);
        s.record_remove(1);
        let snap = s.snapshot();
        assert_eq!(snap.lookups, 2);
        assert_eq!(snap.removes, 1);
        assert_eq!(snap.probe_steps, 13);
        assert_eq!(snap.min_chain, 1);
        assert_eq!(snap.max_chain, 9);
    }
}
