//! Item and query stores.
//!
//! Both stores are owned by the update pipeline and only mutated while its
//! state lock is held.

pub mod item;
pub mod query;

pub use item::{CachedItem, ItemStore};
pub use query::{CachedQuery, QueryStore};
