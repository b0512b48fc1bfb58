//! Item store: per-identity cached values with freshness metadata.

use std::collections::HashMap;

use reflex_core::{Freshness, Model, Timestamp};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

/// One cached identity.
///
/// `value == None` with `fetched_at == Some(_)` means the server confirmed the
/// identity does not exist. `fetched_at == None` means nothing is known yet.
#[derive(Debug)]
pub struct CachedItem<M: Model> {
    value: Option<M>,
    projection: Option<Value>,
    fetched_at: Option<Timestamp>,
    written_at: Option<Timestamp>,
    freshness: Option<Freshness>,
    last_accessed: Instant,
    tx: watch::Sender<Option<M>>,
}

impl<M: Model> CachedItem<M> {
    fn new(now: Instant) -> Self {
        Self {
            value: None,
            projection: None,
            fetched_at: None,
            written_at: None,
            freshness: None,
            last_accessed: now,
            tx: watch::Sender::new(None),
        }
    }

    pub fn value(&self) -> Option<&M> {
        self.value.as_ref()
    }

    /// JSON projection of the value, used for filter and order evaluation.
    pub fn projection(&self) -> Option<&Value> {
        self.projection.as_ref()
    }

    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    /// Server time the current value reflects.
    pub fn written_at(&self) -> Option<Timestamp> {
        self.written_at
    }

    /// Tightest freshness any reader asked for.
    pub fn freshness(&self) -> Option<Freshness> {
        self.freshness
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    /// Returns true if the requirement became tighter.
    pub fn require(&mut self, freshness: Freshness) -> bool {
        let previous = self.freshness;
        self.freshness = Some(match previous {
            Some(current) => current.tighter(freshness),
            None => freshness,
        });
        self.freshness != previous
    }

    /// Whether the entry satisfies `freshness` at `now`.
    pub fn is_fresh(&self, freshness: Freshness, now: Timestamp) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| freshness.is_fresh(fetched_at, now))
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<M>> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Store a new state. Observers are only woken if the value changed.
    fn set(
        &mut self,
        value: Option<M>,
        projection: Option<Value>,
        fetched_at: Option<Timestamp>,
        written_at: Option<Timestamp>,
    ) -> bool {
        self.value = value.clone();
        self.projection = projection;
        self.fetched_at = fetched_at;
        self.written_at = written_at;
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

/// Cached items keyed by identity.
#[derive(Debug)]
pub struct ItemStore<M: Model> {
    entries: HashMap<M::Id, CachedItem<M>>,
    /// Removal times of identities whose entries were dropped.
    tombstones: HashMap<M::Id, Timestamp>,
}

impl<M: Model> Default for ItemStore<M> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }
}

impl<M: Model> ItemStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `id`, marking it accessed.
    pub fn entry(&mut self, id: M::Id, now: Instant) -> &mut CachedItem<M> {
        let entry = self
            .entries
            .entry(id)
            .or_insert_with(|| CachedItem::new(now));
        entry.touch(now);
        entry
    }

    pub fn get(&self, id: &M::Id) -> Option<&CachedItem<M>> {
        self.entries.get(id)
    }

    pub fn value(&self, id: &M::Id) -> Option<M> {
        self.entries.get(id).and_then(|entry| entry.value.clone())
    }

    pub fn projection(&self, id: &M::Id) -> Option<&Value> {
        self.entries.get(id).and_then(CachedItem::projection)
    }

    /// Server time of the newest state known for `id`, including removals.
    pub fn written_at(&self, id: &M::Id) -> Option<Timestamp> {
        self.entries
            .get(id)
            .and_then(CachedItem::written_at)
            .or_else(|| self.tombstones.get(id).copied())
    }

    pub fn contains(&self, id: &M::Id) -> bool {
        self.entries.contains_key(id)
    }

    /// Apply a confirmed value. Returns true if observers saw a change.
    pub fn upsert(
        &mut self,
        id: M::Id,
        value: M,
        projection: Value,
        fetched_at: Timestamp,
        written_at: Timestamp,
        now: Instant,
    ) -> bool {
        self.tombstones.remove(&id);
        self.entries
            .entry(id)
            .or_insert_with(|| CachedItem::new(now))
            .set(Some(value), Some(projection), Some(fetched_at), Some(written_at))
    }

    /// Apply a confirmed removal.
    ///
    /// With `keep_absent` the entry stays as a known-absent value so live
    /// observers keep their channel; otherwise it is dropped.
    pub fn remove(
        &mut self,
        id: &M::Id,
        keep_absent: bool,
        fetched_at: Timestamp,
        written_at: Timestamp,
        now: Instant,
    ) -> bool {
        self.tombstones.insert(id.clone(), written_at);
        if keep_absent {
            self.entries
                .entry(id.clone())
                .or_insert_with(|| CachedItem::new(now))
                .set(None, None, Some(fetched_at), Some(written_at))
        } else {
            self.entries
                .remove(id)
                .is_some_and(|entry| entry.value.is_some())
        }
    }

    /// Record that a fetch found nothing for an identity with no cached value.
    ///
    /// Only existing placeholders are updated. No tombstone is left, since
    /// nothing was removed.
    pub fn mark_absent(&mut self, id: &M::Id, fetched_at: Timestamp, written_at: Timestamp) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.value.is_none() => {
                entry.set(None, None, Some(fetched_at), Some(written_at));
                true
            }
            _ => false,
        }
    }

    /// Forget what is known about `id` so the next read refetches it.
    pub fn invalidate(&mut self, id: &M::Id) -> bool {
        self.tombstones.remove(id);
        match self.entries.get_mut(id) {
            Some(entry) => entry.set(None, None, None, None),
            None => false,
        }
    }

    /// Drop every entry. Entries for which `keep` holds stay as unfetched
    /// placeholders.
    pub fn clear(&mut self, keep: impl Fn(&M::Id) -> bool) {
        self.tombstones.clear();
        self.entries.retain(|id, entry| {
            if keep(id) {
                entry.set(None, None, None, None);
                true
            } else {
                false
            }
        });
    }

    pub fn evict(&mut self, id: &M::Id) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop tombstones recorded before `cutoff`.
    pub fn prune_tombstones(&mut self, cutoff: Timestamp) -> usize {
        let before = self.tombstones.len();
        self.tombstones.retain(|_, removed_at| *removed_at >= cutoff);
        before - self.tombstones.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&M::Id, &CachedItem<M>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
