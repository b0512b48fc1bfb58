//! Identity types for cached models

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::query::{QueryKey, QuerySpec};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Marker trait for values the cache can hold.
///
/// Implementations must provide a stable identity that is unique within the
/// entity kind. The JSON projection produced by `Serialize` is what filters
/// and orderings are evaluated against, so field names used in a
/// [`QuerySpec`] refer to serialized field names.
///
/// # Implementation Requirements
///
/// - `id()` must return the same value for every version of one record
/// - `PartialEq` is used to suppress notifications for no-op updates
/// - `Delta` is whatever the remote API accepts for a partial update
pub trait Model: Clone + PartialEq + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Opaque, comparable identity.
    type Id: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Partial update accepted by the remote API.
    type Delta: Clone + fmt::Debug + Send + Sync + 'static;

    /// Human-readable entity name used in logs and errors.
    fn entity_name() -> &'static str;

    /// Get the unique identifier for this record.
    fn id(&self) -> Self::Id;
}

/// Key identifying one observable cache region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterestKey<Id> {
    /// A single cached item.
    Item(Id),
    /// A cached query result.
    Query(QueryKey),
}

impl<Id> InterestKey<Id> {
    /// Returns true if this key addresses a single item.
    pub fn is_item(&self) -> bool {
        matches!(self, Self::Item(_))
    }

    /// Returns true if this key addresses a query result.
    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

impl<Id: fmt::Display> fmt::Display for InterestKey<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Item(id) => write!(f, "item:{}", id),
            Self::Query(key) => write!(f, "query:{}", key),
        }
    }
}

/// Full description of an interest, carrying what a push channel needs to
/// open a subscription (the item identity or the query's filter).
#[derive(Debug, Clone, PartialEq)]
pub enum Interest<Id> {
    Item(Id),
    Query(QuerySpec),
}

impl<Id: Clone> Interest<Id> {
    /// The registry/cache key for this interest.
    pub fn key(&self) -> InterestKey<Id> {
        match self {
            Self::Item(id) => InterestKey::Item(id.clone()),
            Self::Query(spec) => InterestKey::Query(spec.key()),
        }
    }
}
