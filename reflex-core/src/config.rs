//! Cache configuration

use std::time::Duration;

use crate::constants::*;
use crate::error::{ConfigError, ReflexError, ReflexResult};

/// Runtime configuration for a model cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Freshness window for reads that do not request one (default: 30 seconds)
    pub default_freshness: Duration,

    /// Coalescing window for batched item fetches (default: 5ms)
    pub coalesce_window: Duration,

    /// Maximum identities per batched fetch; a full batch is sent immediately
    pub max_batch_size: usize,

    /// Maximum concurrent API calls
    pub max_in_flight: usize,

    /// Timeout applied to each API call
    pub fetch_timeout: Duration,

    /// Whether push subscriptions are used at all
    pub push_enabled: bool,

    /// Freshness windows below this prefer push over polling
    pub push_threshold: Duration,

    /// Time a push subscription has to confirm its connection
    pub push_connect_timeout: Duration,

    /// Delay before retrying push after falling back to polling
    pub push_retry_interval: Duration,

    /// Poll interval for interests without a freshness window
    pub default_poll_interval: Duration,

    /// Delay between the last release of an interest and sync teardown
    pub release_grace_period: Duration,

    /// Backoff after the first failed poll
    pub initial_backoff: Duration,

    /// Upper bound for poll backoff
    pub max_backoff: Duration,

    /// Backoff growth factor per consecutive failure
    pub backoff_multiplier: f64,

    /// Maximum number of cached items before LRU eviction
    pub max_items: usize,

    /// Maximum number of cached queries before LRU eviction
    pub max_queries: usize,

    /// Unobserved entries idle longer than this are evicted
    pub idle_ttl: Duration,

    /// Interval between garbage collection sweeps
    pub gc_interval: Duration,

    /// Capacity of the change event feed
    pub change_buffer: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_freshness: Duration::from_secs(DEFAULT_FRESHNESS_SECS),
            coalesce_window: Duration::from_millis(DEFAULT_COALESCE_WINDOW_MS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            push_enabled: true,
            push_threshold: Duration::from_secs(DEFAULT_PUSH_THRESHOLD_SECS),
            push_connect_timeout: Duration::from_secs(DEFAULT_PUSH_CONNECT_TIMEOUT_SECS),
            push_retry_interval: Duration::from_secs(DEFAULT_PUSH_RETRY_INTERVAL_SECS),
            default_poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            release_grace_period: Duration::from_millis(DEFAULT_RELEASE_GRACE_MS),
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_items: DEFAULT_MAX_ITEMS,
            max_queries: DEFAULT_MAX_QUERIES,
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(name).unwrap_or(default))
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(name).unwrap_or(default))
}

impl CacheConfig {
    /// Load configuration from `REFLEX_*` environment variables.
    ///
    /// Unset or unparseable variables fall back to the defaults.
    pub fn from_env() -> Self {
        Self {
            default_freshness: env_secs("REFLEX_FRESHNESS_SECS", DEFAULT_FRESHNESS_SECS),
            coalesce_window: env_millis("REFLEX_COALESCE_WINDOW_MS", DEFAULT_COALESCE_WINDOW_MS),
            max_batch_size: env_parse("REFLEX_MAX_BATCH_SIZE").unwrap_or(DEFAULT_MAX_BATCH_SIZE),
            max_in_flight: env_parse("REFLEX_MAX_IN_FLIGHT").unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            fetch_timeout: env_secs("REFLEX_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS),
            push_enabled: std::env::var("REFLEX_PUSH_ENABLED")
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(true),
            push_threshold: env_secs("REFLEX_PUSH_THRESHOLD_SECS", DEFAULT_PUSH_THRESHOLD_SECS),
            push_connect_timeout: env_secs(
                "REFLEX_PUSH_CONNECT_TIMEOUT_SECS",
                DEFAULT_PUSH_CONNECT_TIMEOUT_SECS,
            ),
            push_retry_interval: env_secs(
                "REFLEX_PUSH_RETRY_INTERVAL_SECS",
                DEFAULT_PUSH_RETRY_INTERVAL_SECS,
            ),
            default_poll_interval: env_secs("REFLEX_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS),
            release_grace_period: env_millis("REFLEX_RELEASE_GRACE_MS", DEFAULT_RELEASE_GRACE_MS),
            initial_backoff: env_millis("REFLEX_INITIAL_BACKOFF_MS", DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: env_secs("REFLEX_MAX_BACKOFF_SECS", DEFAULT_MAX_BACKOFF_SECS),
            backoff_multiplier: env_parse("REFLEX_BACKOFF_MULTIPLIER")
                .unwrap_or(DEFAULT_BACKOFF_MULTIPLIER),
            max_items: env_parse("REFLEX_MAX_ITEMS").unwrap_or(DEFAULT_MAX_ITEMS),
            max_queries: env_parse("REFLEX_MAX_QUERIES").unwrap_or(DEFAULT_MAX_QUERIES),
            idle_ttl: env_secs("REFLEX_IDLE_TTL_SECS", DEFAULT_IDLE_TTL_SECS),
            gc_interval: env_secs("REFLEX_GC_INTERVAL_SECS", DEFAULT_GC_INTERVAL_SECS),
            change_buffer: env_parse("REFLEX_CHANGE_BUFFER").unwrap_or(DEFAULT_CHANGE_BUFFER),
        }
    }

    /// Short timers for local development and tests.
    pub fn development() -> Self {
        Self {
            default_freshness: Duration::from_secs(5),
            push_connect_timeout: Duration::from_secs(1),
            push_retry_interval: Duration::from_secs(5),
            default_poll_interval: Duration::from_secs(5),
            release_grace_period: Duration::from_millis(100),
            idle_ttl: Duration::from_secs(30),
            gc_interval: Duration::from_secs(10),
            ..Self::default()
        }
    }

    pub fn with_default_freshness(mut self, freshness: Duration) -> Self {
        self.default_freshness = freshness;
        self
    }

    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_push_enabled(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    pub fn with_push_threshold(mut self, threshold: Duration) -> Self {
        self.push_threshold = threshold;
        self
    }

    pub fn with_push_connect_timeout(mut self, timeout: Duration) -> Self {
        self.push_connect_timeout = timeout;
        self
    }

    pub fn with_push_retry_interval(mut self, interval: Duration) -> Self {
        self.push_retry_interval = interval;
        self
    }

    pub fn with_default_poll_interval(mut self, interval: Duration) -> Self {
        self.default_poll_interval = interval;
        self
    }

    pub fn with_release_grace_period(mut self, grace: Duration) -> Self {
        self.release_grace_period = grace;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_capacity(mut self, max_items: usize, max_queries: usize) -> Self {
        self.max_items = max_items;
        self.max_queries = max_queries;
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_change_buffer(mut self, capacity: usize) -> Self {
        self.change_buffer = capacity;
        self
    }

    /// Poll backoff after `failures` consecutive failures.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(failures.min(64) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ReflexResult<()> {
        let positive_counts = [
            ("max_batch_size", self.max_batch_size),
            ("max_in_flight", self.max_in_flight),
            ("max_items", self.max_items),
            ("max_queries", self.max_queries),
            ("change_buffer", self.change_buffer),
        ];
        for (field, value) in positive_counts {
            if value == 0 {
                return Err(invalid(field, value, "must be greater than 0"));
            }
        }

        let positive_durations = [
            ("fetch_timeout", self.fetch_timeout),
            ("push_connect_timeout", self.push_connect_timeout),
            ("default_poll_interval", self.default_poll_interval),
            ("initial_backoff", self.initial_backoff),
            ("gc_interval", self.gc_interval),
        ];
        for (field, value) in positive_durations {
            if value.is_zero() {
                return Err(invalid(field, format!("{:?}", value), "must be greater than 0"));
            }
        }

        if self.max_backoff < self.initial_backoff {
            return Err(invalid(
                "max_backoff",
                format!("{:?}", self.max_backoff),
                "max_backoff must be at least initial_backoff",
            ));
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(invalid(
                "backoff_multiplier",
                self.backoff_multiplier,
                "backoff_multiplier must be a finite number >= 1.0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ReflexError {
    ReflexError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(CacheConfig::development().validate().is_ok());
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Without environment variables set, should use defaults
        let config = CacheConfig::from_env();
        assert_eq!(config.default_freshness, Duration::from_secs(DEFAULT_FRESHNESS_SECS));
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(
            config.push_connect_timeout,
            Duration::from_secs(DEFAULT_PUSH_CONNECT_TIMEOUT_SECS)
        );
        assert!(config.push_enabled);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let err = CacheConfig::default()
            .with_max_batch_size(0)
            .validate()
            .unwrap_err();
        match err {
            ReflexError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "max_batch_size")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = CacheConfig::default().with_backoff(
            Duration::from_secs(10),
            Duration::from_secs(1),
            2.0,
        );
        assert!(config.validate().is_err());

        let config = CacheConfig::default().with_backoff(
            Duration::from_millis(100),
            Duration::from_secs(1),
            0.5,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = CacheConfig::default().with_backoff(
            Duration::from_millis(500),
            Duration::from_secs(3),
            2.0,
        );
        assert_eq!(config.backoff_for(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(config.backoff_for(3), Duration::from_secs(3));
        assert_eq!(config.backoff_for(40), Duration::from_secs(3));
    }
}
