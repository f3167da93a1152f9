//! Per-call-site call counters for "every Nth call" gating
//!
//! Each site owns an `AtomicU64`, so increments on one site never lose or
//! duplicate a count. Existing counters are bumped under a `DashMap` shard read
//! lock; only the first call at a new site takes the shard write lock.

use crate::match_cache::CallSiteId;
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Concurrent map from call site to observed call count
pub struct CallCounters {
    counts: DashMap<CallSiteId, AtomicU64, FnvBuildHasher>,
}

impl Default for CallCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCounters")
            .field("sites", &self.len())
            .finish()
    }
}

impl CallCounters {
    pub fn new() -> Self {
        Self {
            counts: DashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    /// Count one call at `site` and return the updated count (first call = 1)
    pub fn increment(&self, site: CallSiteId) -> u64 {
        if let Some(counter) = self.counts.get(&site) {
            return counter.fetch_add(1, Ordering::AcqRel) + 1;
        }
        self.counts
            .entry(site)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Current count for `site` (0 if never counted)
    pub fn get(&self, site: CallSiteId) -> u64 {
        self.counts
            .get(&site)
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    /// Number of sites with a counter
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Forget every count
    pub fn clear(&self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_increment_is_one() {
        let counters = CallCounters::new();
        assert_eq!(counters.get(CallSiteId(1)), 0);
        assert_eq!(counters.increment(CallSiteId(1)), 1);
        assert_eq!(counters.increment(CallSiteId(1)), 2);
        assert_eq!(counters.get(CallSiteId(1)), 2);
    }

    #[test]
    fn test_sites_count_independently() {
        let counters = CallCounters::new();
        counters.increment(CallSiteId(1));
        counters.increment(CallSiteId(1));
        counters.increment(CallSiteId(2));
        assert_eq!(counters.get(CallSiteId(1)), 2);
        assert_eq!(counters.get(CallSiteId(2)), 1);
        assert_eq!(counters.len(), 2);
    }

    #[test]
    fn test_clear_resets() {
        let counters = CallCounters::new();
        counters.increment(CallSiteId(1));
        counters.clear();
        assert!(counters.is_empty());
        assert_eq!(counters.increment(CallSiteId(1)), 1);
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let counters = Arc::new(CallCounters::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        counters.increment(CallSiteId(i % 4));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for site in 0..4 {
            assert_eq!(counters.get(CallSiteId(site)), 2_000);
        }
    }

    #[test]
    fn test_concurrent_increments_return_unique_counts() {
        let counters = Arc::new(CallCounters::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = counters.clone();
                std::thread::spawn(move || {
                    (0..500)
                        .map(|_| counters.increment(CallSiteId(42)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=2_000).collect::<Vec<_>>());
    }
}
