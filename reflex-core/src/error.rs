//! Error types for REFLEX operations

use std::time::Duration;
use thiserror::Error;

/// Failures talking to the remote model API or push channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network failure during {operation}: {reason}")]
    Network { operation: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("{operation} rejected by server: {reason}")]
    Rejected { operation: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Build a network failure for `operation`.
    pub fn network(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Build a rejection for `operation`.
    pub fn rejected(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Timeout { .. })
    }
}

/// Detected breaks of the cache's own invariants.
///
/// These never reach callers of read operations: the affected region is
/// invalidated and refetched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("Query {query} references item {id} missing from the item store")]
    MissingItem { query: String, id: String },

    #[error("Query {query} result is out of order")]
    OrderViolated { query: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all REFLEX errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReflexError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache is shutting down")]
    ShuttingDown,
}

/// Result type alias for REFLEX operations.
pub type ReflexResult<T> = Result<T, ReflexError>;

// =============================================================================
// TESTS
// =============================================================================
