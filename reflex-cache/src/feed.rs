//! Ordered feed of every change the cache applies.

use reflex_core::{ChangeEvent, Model};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// One entry read from a [`ChangeFeed`].
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem<M: Model> {
    Event(ChangeEvent<M>),
    /// The consumer fell behind and this many events were skipped.
    Lagged(u64),
}

/// Receives applied changes in the order they were applied.
///
/// The feed is buffered. A consumer that falls further behind than the
/// buffer sees [`FeedItem::Lagged`] and resumes at the oldest retained event.
pub struct ChangeFeed<M: Model> {
    rx: broadcast::Receiver<ChangeEvent<M>>,
}

impl<M: Model> ChangeFeed<M> {
    pub(crate) fn new(rx: broadcast::Receiver<ChangeEvent<M>>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the cache is gone.
    pub async fn next(&mut self) -> Option<FeedItem<M>> {
        match self.rx.recv().await {
            Ok(event) => Some(FeedItem::Event(event)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    entity = M::entity_name(),
                    skipped, "Change feed consumer lagged"
                );
                Some(FeedItem::Lagged(skipped))
            }
            Err(RecvError::Closed) => None,
        }
    }

    /// Next change if one is already buffered.
    pub fn try_next(&mut self) -> Option<FeedItem<M>> {
        match self.rx.try_recv() {
            Ok(event) => Some(FeedItem::Event(event)),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(
                    entity = M::entity_name(),
                    skipped, "Change feed consumer lagged"
                );
                Some(FeedItem::Lagged(skipped))
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Next event, skipping lag markers.
    pub async fn next_event(&mut self) -> Option<ChangeEvent<M>> {
        loop {
            match self.next().await? {
                FeedItem::Event(event) => return Some(event),
                FeedItem::Lagged(_) => continue,
            }
        }
    }
}
