//! REFLEX Core - Cache Data Types
//!
//! Pure data structures shared by the cache runtime and its collaborators.
//! This crate contains ONLY data types and pure evaluation logic - no I/O,
//! no timers, no channels.

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod filter;
pub mod freshness;
pub mod identity;
pub mod query;

pub use config::CacheConfig;
pub use error::{ConfigError, ConsistencyError, ReflexError, ReflexResult, TransportError};
pub use event::{ChangeEvent, ChangeNotification, PushMessage, UpdateSource};
pub use filter::{FilterExpr, FilterOperator};
pub use freshness::{CacheRead, Freshness};
pub use identity::{Interest, InterestKey, Model, Timestamp};
pub use query::{OrderBy, QueryKey, QuerySpec, SortDirection, SortKey};
