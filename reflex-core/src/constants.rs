//! Constants for REFLEX
//!
//! Default values for [`crate::CacheConfig`]. Centralizing them keeps the
//! defaults easy to find and lets tests assert against them.

// ============================================================================
// FRESHNESS
// ============================================================================

/// Default freshness window for cached entries in seconds
pub const DEFAULT_FRESHNESS_SECS: u64 = 30;

// ============================================================================
// TRANSPORT
// ============================================================================

/// Window during which concurrent item fetches are coalesced, in milliseconds
pub const DEFAULT_COALESCE_WINDOW_MS: u64 = 5;

/// Maximum number of identities in a single batched fetch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Maximum number of concurrent API calls
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Timeout for a single API call in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// PUSH / POLL
// ============================================================================

/// Freshness windows below this use push instead of polling, in seconds
pub const DEFAULT_PUSH_THRESHOLD_SECS: u64 = 10;

/// Time a push subscription has to confirm its connection, in seconds
pub const DEFAULT_PUSH_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Delay before retrying push after falling back to polling, in seconds
pub const DEFAULT_PUSH_RETRY_INTERVAL_SECS: u64 = 30;

/// Poll interval when an interest has no freshness window of its own, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Grace period before tearing down sync after the last release, in milliseconds
pub const DEFAULT_RELEASE_GRACE_MS: u64 = 1000;

/// Initial poll retry backoff in milliseconds
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Maximum poll retry backoff in seconds
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;

/// Backoff growth factor per consecutive failure
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

// ============================================================================
// EVICTION
// ============================================================================

/// Maximum number of cached items
pub const DEFAULT_MAX_ITEMS: usize = 10_000;

/// Maximum number of cached queries
pub const DEFAULT_MAX_QUERIES: usize = 500;

/// Idle time after which an unobserved entry is evicted, in seconds
pub const DEFAULT_IDLE_TTL_SECS: u64 = 300;

/// Interval between garbage collection sweeps in seconds
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

// ============================================================================
// CHANGE FEED
// ============================================================================

/// Capacity of the change event broadcast channel
pub const DEFAULT_CHANGE_BUFFER: usize = 1024;
