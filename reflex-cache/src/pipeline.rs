//! Update pipeline: the single funnel every change flows through.
//!
//! All store, registry and guard state lives in one [`CacheState`] behind a
//! lock. `publish` takes the lock, applies the events in order, reconstructs
//! every affected query, wakes observers and forwards the applied events to
//! the change feed before releasing it. No I/O happens while the lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use reflex_core::{
    CacheConfig, ChangeEvent, ConsistencyError, InterestKey, Model, QueryKey, QuerySpec,
    Timestamp, UpdateSource,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::CacheMetrics;
use crate::registry::SubscriptionRegistry;
use crate::store::{ItemStore, QueryStore};
use crate::sync::ActivationGuard;

/// Everything the pipeline owns.
#[derive(Debug)]
pub struct CacheState<M: Model> {
    pub items: ItemStore<M>,
    pub queries: QueryStore<M>,
    pub registry: SubscriptionRegistry<M::Id>,
    pub guard: ActivationGuard<M::Id>,
}

impl<M: Model> Default for CacheState<M> {
    fn default() -> Self {
        Self {
            items: ItemStore::new(),
            queries: QueryStore::new(),
            registry: SubscriptionRegistry::new(),
            guard: ActivationGuard::new(),
        }
    }
}

impl<M: Model> CacheState<M> {
    /// Whether fetched data for `id`, snapshotted at `snapshot_at`, may be applied.
    ///
    /// Rejected when the cache already holds a newer state for the identity,
    /// or when a push subscription covering it became active after the snapshot.
    pub fn admits_fetch(&self, id: &M::Id, projection: Option<&Value>, snapshot_at: Timestamp) -> bool {
        if self
            .items
            .written_at(id)
            .is_some_and(|written_at| snapshot_at < written_at)
        {
            return false;
        }
        if self.guard.is_empty() {
            return true;
        }
        if !self.guard.admits(&InterestKey::Item(id.clone()), snapshot_at) {
            return false;
        }
        self.queries.iter().all(|(key, query)| {
            let covers = query.contains(id) || projection.is_some_and(|p| query.spec().matches(p));
            !covers || self.guard.admits(&InterestKey::Query(key.clone()), snapshot_at)
        })
    }
}

/// What a publish did.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOutcome<Id> {
    /// Events applied to the stores.
    pub applied: usize,
    /// Fetch results dropped as older than the cached state.
    pub discarded: usize,
    /// Regions that were invalidated and need a refetch.
    pub refetch: Vec<InterestKey<Id>>,
}

impl<Id> Default for PublishOutcome<Id> {
    fn default() -> Self {
        Self {
            applied: 0,
            discarded: 0,
            refetch: Vec::new(),
        }
    }
}

/// Result of one garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub items_evicted: usize,
    pub queries_evicted: usize,
}

pub struct UpdatePipeline<M: Model> {
    state: Mutex<CacheState<M>>,
    changes: broadcast::Sender<ChangeEvent<M>>,
    metrics: Arc<CacheMetrics>,
}

impl<M: Model> UpdatePipeline<M> {
    pub fn new(change_buffer: usize, metrics: Arc<CacheMetrics>) -> Self {
        let (changes, _rx) = broadcast::channel(change_buffer.max(1));
        Self {
            state: Mutex::new(CacheState::default()),
            changes,
            metrics,
        }
    }

    /// Run `f` with exclusive access to the cache state.
    ///
    /// `f` must not call back into the pipeline.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CacheState<M>) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Receive every applied event from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent<M>> {
        self.changes.subscribe()
    }

    pub fn publish(&self, event: ChangeEvent<M>, source: UpdateSource<M::Id>) -> PublishOutcome<M::Id> {
        self.publish_all([event], source)
    }

    /// Apply events in order as one step.
    pub fn publish_all(
        &self,
        events: impl IntoIterator<Item = ChangeEvent<M>>,
        source: UpdateSource<M::Id>,
    ) -> PublishOutcome<M::Id> {
        let mut outcome = PublishOutcome::default();
        self.with_state(|state| {
            for event in events {
                self.apply(state, event, &source, &mut outcome);
            }
        });
        outcome
    }

    /// Apply the result of an item fetch snapshotted at `snapshot_at`.
    ///
    /// A requested identity missing from `found` is published as a removal
    /// only when the cache holds a value for it. Otherwise the absence is
    /// recorded without an event.
    pub fn apply_item_fetch(
        &self,
        ids: &[M::Id],
        mut found: HashMap<M::Id, M>,
        snapshot_at: Timestamp,
    ) -> PublishOutcome<M::Id> {
        let source = UpdateSource::Fetch { snapshot_at };
        let mut outcome = PublishOutcome::default();
        self.with_state(|state| {
            for id in ids {
                if let Some(value) = found.remove(id) {
                    self.apply(state, ChangeEvent::Upserted(id.clone(), value), &source, &mut outcome);
                } else if state.items.get(id).is_some_and(|entry| entry.value().is_some()) {
                    self.apply(state, ChangeEvent::Removed(id.clone()), &source, &mut outcome);
                } else if state.admits_fetch(id, None, snapshot_at) {
                    state.items.mark_absent(id, Utc::now(), snapshot_at);
                } else {
                    self.discard(id, &mut outcome);
                }
            }
        });
        outcome
    }

    /// Apply a query result fetched at `snapshot_at`.
    ///
    /// Each returned value goes through the normal upsert path. The query's
    /// matched list is then rebuilt from the cache's current view of the
    /// returned identities plus anything the cache learned after the snapshot.
    /// Returns the result to hand to callers waiting on the fetch.
    pub fn apply_query_result(
        &self,
        spec: &QuerySpec,
        values: Vec<M>,
        snapshot_at: Timestamp,
    ) -> (PublishOutcome<M::Id>, Vec<M>) {
        let source = UpdateSource::Fetch { snapshot_at };
        let key = spec.key();
        let mut outcome = PublishOutcome::default();

        let result = self.with_state(|state| {
            let mut returned: HashSet<M::Id> = HashSet::with_capacity(values.len());
            for value in &values {
                returned.insert(value.id());
            }
            for value in values.iter().cloned() {
                self.apply(state, ChangeEvent::upserted(value), &source, &mut outcome);
            }

            if !state.guard.admits(&InterestKey::Query(key.clone()), snapshot_at) {
                CacheMetrics::incr(&self.metrics.stale_discards);
                outcome.discarded += 1;
                debug!(
                    entity = M::entity_name(),
                    query = %key,
                    "Discarded query result older than push activation"
                );
                return state
                    .queries
                    .get(&key)
                    .filter(|query| query.is_fetched())
                    .and_then(|query| query.materialize(&state.items).ok())
                    .unwrap_or_else(|| spec.evaluate(values.iter().cloned()));
            }

            let candidates: Vec<M> = state
                .items
                .iter()
                .filter(|(id, entry)| {
                    returned.contains(*id)
                        || entry.written_at().is_some_and(|written_at| written_at > snapshot_at)
                })
                .filter_map(|(_, entry)| entry.value().cloned())
                .collect();
            let matched = spec
                .evaluate(candidates)
                .iter()
                .map(M::id)
                .collect::<Vec<_>>();

            let now = Utc::now();
            state.queries.entry(spec, Instant::now()).install(matched, now);
            self.refresh_queries(state, [key.clone()], &mut outcome);

            state
                .queries
                .get(&key)
                .and_then(|query| query.materialize(&state.items).ok())
                .unwrap_or_default()
        });
        (outcome, result)
    }

    fn apply(
        &self,
        state: &mut CacheState<M>,
        event: ChangeEvent<M>,
        source: &UpdateSource<M::Id>,
        outcome: &mut PublishOutcome<M::Id>,
    ) {
        let now = Utc::now();
        let instant = Instant::now();
        let written_at = source.snapshot_at().unwrap_or(now);

        match &event {
            ChangeEvent::Upserted(id, value) => {
                let projection = match serde_json::to_value(value) {
                    Ok(projection) => projection,
                    Err(e) => {
                        warn!(entity = M::entity_name(), id = %id, error = %e, "Failed to project value, dropping update");
                        return;
                    }
                };
                if let Some(snapshot_at) = source.snapshot_at() {
                    if !state.admits_fetch(id, Some(&projection), snapshot_at) {
                        self.discard(id, outcome);
                        return;
                    }
                }

                state
                    .items
                    .upsert(id.clone(), value.clone(), projection.clone(), now, written_at, instant);

                let items = &state.items;
                let queries = &mut state.queries;
                let mut touched = Vec::new();
                let mut violations = Vec::new();
                for (key, query) in queries.iter_mut() {
                    match query.reconstruct_upsert(id, &projection, |other| items.projection(other)) {
                        Ok(true) => touched.push(key.clone()),
                        Ok(false) => {}
                        Err(err) => violations.push((key.clone(), err)),
                    }
                }
                for (key, err) in violations {
                    self.violation(state, key, err, outcome);
                }
                self.refresh_queries(state, touched, outcome);
            }

            ChangeEvent::Removed(id) => {
                if let Some(snapshot_at) = source.snapshot_at() {
                    let projection = state.items.projection(id).cloned();
                    if !state.admits_fetch(id, projection.as_ref(), snapshot_at) {
                        self.discard(id, outcome);
                        return;
                    }
                }

                let keep_absent = state.registry.is_active(&InterestKey::Item(id.clone()));
                state.items.remove(id, keep_absent, now, written_at, instant);

                let touched: Vec<QueryKey> = state
                    .queries
                    .iter_mut()
                    .filter_map(|(key, query)| query.reconstruct_removed(id).then(|| key.clone()))
                    .collect();
                self.refresh_queries(state, touched, outcome);
            }

            ChangeEvent::Invalidated(InterestKey::Item(id)) => {
                state.items.invalidate(id);
                let own = InterestKey::Item(id.clone());
                if state.registry.is_active(&own) {
                    outcome.refetch.push(own);
                }
                let dependents: Vec<QueryKey> = state
                    .queries
                    .iter()
                    .filter(|(_, query)| query.contains(id))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in dependents {
                    state.queries.invalidate(&key);
                    let key = InterestKey::Query(key);
                    if state.registry.is_active(&key) {
                        outcome.refetch.push(key);
                    }
                }
            }

            ChangeEvent::Invalidated(InterestKey::Query(key)) => {
                state.queries.invalidate(key);
                let own = InterestKey::Query(key.clone());
                if state.registry.is_active(&own) {
                    outcome.refetch.push(own);
                }
            }

            ChangeEvent::Cleared => {
                let CacheState {
                    items,
                    queries,
                    registry,
                    ..
                } = &mut *state;
                items.clear(|id| registry.is_active(&InterestKey::Item(id.clone())));
                queries.clear(|key| registry.is_active(&InterestKey::Query(key.clone())));
                // Observed regions stay as placeholders and are fetched again.
                outcome.refetch.extend(registry.active_keys());
            }
        }

        outcome.applied += 1;
        debug!(
            entity = M::entity_name(),
            kind = event.kind(),
            source = source.label(),
            "Applied change"
        );
        // No receivers is fine.
        let _ = self.changes.send(event);
    }

    fn discard(&self, id: &M::Id, outcome: &mut PublishOutcome<M::Id>) {
        CacheMetrics::incr(&self.metrics.stale_discards);
        outcome.discarded += 1;
        debug!(
            entity = M::entity_name(),
            id = %id,
            "Discarded fetch result older than cached state"
        );
    }

    fn violation(
        &self,
        state: &mut CacheState<M>,
        key: QueryKey,
        err: ConsistencyError,
        outcome: &mut PublishOutcome<M::Id>,
    ) {
        CacheMetrics::incr(&self.metrics.consistency_violations);
        warn!(
            entity = M::entity_name(),
            query = %key,
            error = %err,
            "Consistency violation, invalidating query"
        );
        state.queries.invalidate(&key);
        let key = InterestKey::Query(key);
        if state.registry.is_active(&key) {
            outcome.refetch.push(key);
        }
    }

    /// Materialize touched queries and wake their observers.
    fn refresh_queries(
        &self,
        state: &mut CacheState<M>,
        keys: impl IntoIterator<Item = QueryKey>,
        outcome: &mut PublishOutcome<M::Id>,
    ) {
        for key in keys {
            let Some(query) = state.queries.get(&key) else {
                continue;
            };
            match query.materialize(&state.items) {
                Ok(values) => {
                    query.notify(values);
                }
                Err(err) => self.violation(state, key, err, outcome),
            }
        }
    }

    /// Evict idle and excess entries nobody observes.
    ///
    /// Queries go first so that items they no longer pin become eligible.
    /// Within each store, entries idle longer than `idle_ttl` are evicted,
    /// then the least recently accessed ones until the store is under its cap.
    pub fn collect_garbage(&self, config: &CacheConfig) -> GcReport {
        let instant = Instant::now();
        let now = Utc::now();

        let report = self.with_state(|state| {
            let CacheState {
                items,
                queries,
                registry,
                ..
            } = &mut *state;

            let mut query_candidates: Vec<(QueryKey, Instant)> = queries
                .iter()
                .filter(|(key, _)| !registry.is_active(&InterestKey::Query((*key).clone())))
                .map(|(key, query)| (key.clone(), query.last_accessed()))
                .collect();
            let evict_queries = select_victims(&mut query_candidates, queries.len(), config.max_queries, instant, config);
            for key in &evict_queries {
                queries.evict(key);
            }

            let pinned = queries.referenced_ids();
            let mut item_candidates: Vec<(M::Id, Instant)> = items
                .iter()
                .filter(|(id, _)| !pinned.contains(*id))
                .filter(|(id, _)| !registry.is_active(&InterestKey::Item((*id).clone())))
                .map(|(id, entry)| (id.clone(), entry.last_accessed()))
                .collect();
            let evict_items = select_victims(&mut item_candidates, items.len(), config.max_items, instant, config);
            for id in &evict_items {
                items.evict(id);
            }

            if let Some(cutoff) = chrono::Duration::from_std(config.idle_ttl)
                .ok()
                .and_then(|ttl| now.checked_sub_signed(ttl))
            {
                items.prune_tombstones(cutoff);
            }

            GcReport {
                items_evicted: evict_items.len(),
                queries_evicted: evict_queries.len(),
            }
        });

        let evicted = (report.items_evicted + report.queries_evicted) as u64;
        if evicted > 0 {
            CacheMetrics::add(&self.metrics.evictions, evicted);
            debug!(
                entity = M::entity_name(),
                items = report.items_evicted,
                queries = report.queries_evicted,
                "Evicted idle cache entries"
            );
        }
        report
    }
}

/// Pick eviction victims among `candidates` (key, last access).
fn select_victims<K>(
    candidates: &mut Vec<(K, Instant)>,
    total: usize,
    cap: usize,
    now: Instant,
    config: &CacheConfig,
) -> Vec<K> {
    candidates.sort_by_key(|(_, last_accessed)| *last_accessed);
    let mut remaining = total;
    let mut victims = Vec::new();
    for (key, last_accessed) in candidates.drain(..) {
        let idle = now.saturating_duration_since(last_accessed) > config.idle_ttl;
        if idle || remaining > cap {
            victims.push(key);
            remaining -= 1;
        }
    }
    victims
}
