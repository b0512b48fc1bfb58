//! Freshness contracts for cache reads.
//!
//! Callers state how stale a value they are willing to accept. The window
//! decides whether a cached entry may be served as-is, whether a background
//! refetch is needed, and whether an observed interest is synchronized by
//! push or by polling.

use chrono::Utc;
use std::time::Duration;

use crate::identity::Timestamp;

/// Freshness requirement for cache reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Accept cached data up to the specified age.
    ///
    /// Older data is still returned to observers immediately, but a refetch
    /// is scheduled.
    BestEffort {
        /// Maximum acceptable staleness for cached data.
        max_staleness: Duration,
    },

    /// Demand a server round trip on every read.
    ///
    /// Observers with this requirement are kept in sync by push whenever
    /// the channel supports it.
    #[default]
    Consistent,
}

impl Freshness {
    /// Create a BestEffort freshness with the given max staleness.
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    /// Create a Consistent freshness requirement.
    pub fn consistent() -> Self {
        Self::Consistent
    }

    /// Returns true if this is a BestEffort freshness.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }

    /// Returns true if this is a Consistent freshness.
    pub fn is_consistent(&self) -> bool {
        matches!(self, Self::Consistent)
    }

    /// The freshness window: max staleness for BestEffort, zero for Consistent.
    pub fn window(&self) -> Duration {
        match self {
            Self::BestEffort { max_staleness } => *max_staleness,
            Self::Consistent => Duration::ZERO,
        }
    }

    /// The stricter of two requirements.
    pub fn tighter(self, other: Freshness) -> Freshness {
        if other.window() < self.window() {
            other
        } else {
            self
        }
    }

    /// Whether data fetched at `fetched_at` still satisfies this requirement at `now`.
    ///
    /// Consistent data is never fresh.
    pub fn is_fresh(&self, fetched_at: Timestamp, now: Timestamp) -> bool {
        match self {
            Self::Consistent => false,
            Self::BestEffort { max_staleness } => {
                let age = (now - fetched_at).to_std().unwrap_or(Duration::ZERO);
                age <= *max_staleness
            }
        }
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    /// The cached value.
    value: T,
    /// When this value was fetched from the server.
    fetched_at: Timestamp,
    /// Whether this was served from the cache without a round trip.
    was_cache_hit: bool,
}

impl<T> CacheRead<T> {
    /// Create a new cache read from a cache hit.
    pub fn from_cache(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            was_cache_hit: true,
        }
    }

    /// Create a new cache read from a server fetch (cache miss).
    pub fn from_server(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            was_cache_hit: false,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    /// Calculate how stale the data is.
    pub fn staleness(&self) -> Duration {
        (Utc::now() - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Map the value while keeping the metadata.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> CacheRead<U> {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            was_cache_hit: self.was_cache_hit,
        }
    }
}
