//! In-flight requests shared by every caller asking for the same key.

use std::sync::Arc;

use chrono::Utc;
use reflex_core::{ReflexError, ReflexResult, Timestamp, TransportError};
use tokio::sync::watch;

type Slot<T> = Option<ReflexResult<T>>;

/// One in-flight network operation.
///
/// Clones share the same result slot. Every waiter receives a clone of the
/// single result.
#[derive(Debug)]
pub struct PendingRequest<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
    created_at: Timestamp,
}

impl<T> Clone for PendingRequest<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            created_at: self.created_at,
        }
    }
}

impl<T: Clone> PendingRequest<T> {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(None)),
            created_at: Utc::now(),
        }
    }

    /// When the request was created. Data it returns is at least this new.
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn waiter(&self) -> Waiter<T> {
        Waiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Whether anyone is still waiting on the result.
    pub fn has_waiters(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub fn same_as(&self, other: &PendingRequest<T>) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    pub fn complete(&self, result: ReflexResult<T>) {
        self.tx.send_replace(Some(result));
    }
}

impl<T: Clone> Default for PendingRequest<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to await a [`PendingRequest`].
#[derive(Debug)]
pub struct Waiter<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T: Clone> Waiter<T> {
    pub async fn wait(mut self) -> ReflexResult<T> {
        loop {
            if let Some(result) = self.rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            if self.rx.changed().await.is_err() {
                // The request was dropped without completing.
                return Err(ReflexError::Transport(TransportError::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_waiters_share_one_result() {
        let request: PendingRequest<u32> = PendingRequest::new();
        let a = request.waiter();
        let b = request.clone().waiter();
        assert!(request.has_waiters());

        request.complete(Ok(7));
        assert_eq!(a.wait().await, Ok(7));
        assert_eq!(b.wait().await, Ok(7));
        assert!(!request.has_waiters());
    }

    #[tokio::test]
    async fn test_waiter_after_completion_sees_result() {
        let request: PendingRequest<u32> = PendingRequest::new();
        request.complete(Err(TransportError::Closed.into()));
        assert!(request.waiter().wait().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_request_closes_waiters() {
        let request: PendingRequest<u32> = PendingRequest::new();
        let waiter = request.waiter();
        drop(request);
        assert_eq!(
            waiter.wait().await,
            Err(ReflexError::Transport(TransportError::Closed))
        );
    }

    #[tokio::test]
    async fn test_same_as() {
        let a: PendingRequest<u32> = PendingRequest::new();
        let b = a.clone();
        let c = PendingRequest::new();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }
}
