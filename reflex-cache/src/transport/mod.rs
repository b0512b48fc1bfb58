//! Network side of the cache: request coalescing and sync drivers.

pub mod coordinator;
pub mod pending;

pub use coordinator::TransportCoordinator;
pub use pending::{PendingRequest, Waiter};
