//! Change vocabulary of the cache
//!
//! [`ChangeEvent`] is the only input the update pipeline accepts and the only
//! thing it emits. Push channels speak the narrower [`ChangeNotification`]
//! and wrap it in a [`PushMessage`] together with connection signals.

use crate::identity::{InterestKey, Model, Timestamp};

/// A change to cached state.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<M: Model> {
    /// The server-confirmed value of an identity.
    Upserted(M::Id, M),
    /// The identity no longer exists on the server.
    Removed(M::Id),
    /// One cache region can no longer be trusted and must be refetched.
    Invalidated(InterestKey<M::Id>),
    /// Full invalidation of every cached entry.
    Cleared,
}

impl<M: Model> ChangeEvent<M> {
    /// Build an upsert from a value, deriving its identity.
    pub fn upserted(value: M) -> Self {
        Self::Upserted(value.id(), value)
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Upserted(..) => "upserted",
            Self::Removed(_) => "removed",
            Self::Invalidated(_) => "invalidated",
            Self::Cleared => "cleared",
        }
    }

    /// The identity touched by this event, if it targets a single item.
    pub fn identity(&self) -> Option<&M::Id> {
        match self {
            Self::Upserted(id, _) | Self::Removed(id) => Some(id),
            Self::Invalidated(InterestKey::Item(id)) => Some(id),
            Self::Invalidated(InterestKey::Query(_)) | Self::Cleared => None,
        }
    }
}

/// A change delivered by a push subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification<M: Model> {
    Upserted(M),
    Removed(M::Id),
}

impl<M: Model> ChangeNotification<M> {
    pub fn into_event(self) -> ChangeEvent<M> {
        match self {
            Self::Upserted(value) => ChangeEvent::upserted(value),
            Self::Removed(id) => ChangeEvent::Removed(id),
        }
    }
}

/// Messages a push subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage<M: Model> {
    /// The subscription is live; changes after `active_at` will be delivered.
    Connected { active_at: Timestamp },
    /// A change matching the subscription.
    Notification(ChangeNotification<M>),
    /// The server dropped updates for this subscription.
    Overloaded,
}

/// Where a published change came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource<Id> {
    /// Result of a confirmed write.
    Mutation,
    /// Result of a fetch whose data reflects the server at `snapshot_at`.
    Fetch { snapshot_at: Timestamp },
    /// Delivered by the push subscription for `interest`.
    Push { interest: InterestKey<Id> },
    /// Published directly by the application.
    Manual,
    /// Emitted by the cache itself to recover from a detected gap.
    Recovery,
}

impl<Id> UpdateSource<Id> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Fetch { .. } => "fetch",
            Self::Push { .. } => "push",
            Self::Manual => "manual",
            Self::Recovery => "recovery",
        }
    }

    /// The snapshot time of fetched data, if any.
    pub fn snapshot_at(&self) -> Option<Timestamp> {
        match self {
            Self::Fetch { snapshot_at } => Some(*snapshot_at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Note {
        id: u64,
        body: String,
    }

    impl Model for Note {
        type Id = u64;
        type Delta = String;

        fn entity_name() -> &'static str {
            "note"
        }

        fn id(&self) -> u64 {
            self.id
        }
    }

    #[test]
    fn test_notification_into_event() {
        let note = Note {
            id: 7,
            body: "hi".to_string(),
        };
        let event = ChangeNotification::Upserted(note.clone()).into_event();
        assert_eq!(event, ChangeEvent::Upserted(7, note));
        assert_eq!(event.kind(), "upserted");
        assert_eq!(event.identity(), Some(&7));

        let removed = ChangeNotification::<Note>::Removed(3).into_event();
        assert_eq!(removed, ChangeEvent::Removed(3));
    }

    #[test]
    fn test_event_identity() {
        assert_eq!(ChangeEvent::<Note>::Cleared.identity(), None);
        assert_eq!(
            ChangeEvent::<Note>::Invalidated(InterestKey::Item(4)).identity(),
            Some(&4)
        );
    }

    #[test]
    fn test_update_source_snapshot() {
        let now = chrono::Utc::now();
        let fetch: UpdateSource<u64> = UpdateSource::Fetch { snapshot_at: now };
        assert_eq!(fetch.snapshot_at(), Some(now));
        assert_eq!(fetch.label(), "fetch");
        assert_eq!(UpdateSource::<u64>::Mutation.snapshot_at(), None);
    }
}
