//! Cache activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for cache activity since construction.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads served from cache without a round trip
    pub cache_hits: AtomicU64,

    /// Reads that had to wait for the network
    pub cache_misses: AtomicU64,

    /// Item fetch round trips (`get` or `get_many`)
    pub item_fetches: AtomicU64,

    /// Query fetch round trips
    pub query_fetches: AtomicU64,

    /// Identities requested through batched fetches
    pub batched_ids: AtomicU64,

    /// Requests that joined an in-flight request for the same key
    pub dedup_hits: AtomicU64,

    /// Requests dropped before dispatch because nobody wanted them anymore
    pub cancelled_requests: AtomicU64,

    /// Failed fetches
    pub fetch_failures: AtomicU64,

    /// Confirmed writes applied to the cache
    pub mutations: AtomicU64,

    /// Fetch results discarded as older than what the cache holds
    pub stale_discards: AtomicU64,

    /// Regions invalidated after an internal inconsistency was detected
    pub consistency_violations: AtomicU64,

    /// Overload signals received from the push channel
    pub overloads: AtomicU64,

    /// Entries removed by garbage collection
    pub evictions: AtomicU64,

    /// Push subscriptions confirmed
    pub push_connects: AtomicU64,

    /// Push subscriptions that failed to confirm in time
    pub push_timeouts: AtomicU64,

    /// Poll cycles executed
    pub poll_cycles: AtomicU64,
}

impl CacheMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            item_fetches: self.item_fetches.load(Ordering::Relaxed),
            query_fetches: self.query_fetches.load(Ordering::Relaxed),
            batched_ids: self.batched_ids.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            cancelled_requests: self.cancelled_requests.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
            stale_discards: self.stale_discards.load(Ordering::Relaxed),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            push_connects: self.push_connects.load(Ordering::Relaxed),
            push_timeouts: self.push_timeouts.load(Ordering::Relaxed),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub item_fetches: u64,
    pub query_fetches: u64,
    pub batched_ids: u64,
    pub dedup_hits: u64,
    pub cancelled_requests: u64,
    pub fetch_failures: u64,
    pub mutations: u64,
    pub stale_discards: u64,
    pub consistency_violations: u64,
    pub overloads: u64,
    pub evictions: u64,
    pub push_connects: u64,
    pub push_timeouts: u64,
    pub poll_cycles: u64,
}

impl MetricsSnapshot {
    /// Fraction of reads served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
