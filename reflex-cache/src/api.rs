//! Collaborator traits: the remote model API and the optional push channel.

use std::collections::HashMap;

use async_trait::async_trait;
use reflex_core::{Interest, Model, PushMessage, QuerySpec, TransportError};
use tokio::sync::mpsc;

/// Result type for remote API calls.
pub type ApiResult<T> = Result<T, TransportError>;

/// Request/response access to the authoritative data store.
///
/// Every write returns the server-confirmed end state so the cache never
/// has to guess what the server did with a request.
#[async_trait]
pub trait ModelApi<M: Model>: Send + Sync {
    /// Fetch one record. `Ok(None)` means it does not exist.
    async fn get(&self, id: &M::Id) -> ApiResult<Option<M>>;

    /// Fetch several records in one round trip. Missing ids are absent from the map.
    async fn get_many(&self, ids: &[M::Id]) -> ApiResult<HashMap<M::Id, M>>;

    /// Run a query on the server.
    async fn query(&self, spec: &QuerySpec) -> ApiResult<Vec<M>>;

    /// Create a record.
    async fn insert(&self, value: M) -> ApiResult<M>;

    /// Replace a record wholesale.
    async fn replace(&self, id: &M::Id, value: M) -> ApiResult<M>;

    /// Apply a partial update.
    async fn update(&self, id: &M::Id, delta: M::Delta) -> ApiResult<M>;

    /// Delete a record.
    async fn delete(&self, id: &M::Id) -> ApiResult<()>;
}

/// Receiving half of a push subscription.
///
/// Dropping it unsubscribes. The sender closing means the channel dropped
/// the subscription.
pub type PushSubscription<M> = mpsc::Receiver<PushMessage<M>>;

/// Optional server push capability.
#[async_trait]
pub trait PushChannel<M: Model>: Send + Sync {
    /// Whether push can be used at all right now.
    fn is_available(&self) -> bool;

    /// Open a subscription for one item or one query filter.
    ///
    /// The subscription must yield [`PushMessage::Connected`] once the
    /// server confirms it.
    async fn subscribe(&self, interest: &Interest<M::Id>) -> ApiResult<PushSubscription<M>>;
}

/// Push channel for deployments without push support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPush;

#[async_trait]
impl<M: Model> PushChannel<M> for NoPush {
    fn is_available(&self) -> bool {
        false
    }

    async fn subscribe(&self, _interest: &Interest<M::Id>) -> ApiResult<PushSubscription<M>> {
        Err(TransportError::Closed)
    }
}
