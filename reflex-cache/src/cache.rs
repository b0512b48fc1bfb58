//! Consumer-facing cache facade.
//!
//! [`ModelCache`] ties the pieces together: observers register interest and
//! receive [`Observable`] handles, reads serve fresh-enough data from the
//! store or join a batched fetch, writes go to the server and publish the
//! confirmed result. Background tasks release idle interests after a grace
//! period and sweep unobserved entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reflex_core::{
    CacheConfig, CacheRead, ChangeEvent, Freshness, Interest, InterestKey, Model, QuerySpec,
    ReflexError, ReflexResult, Timestamp, UpdateSource,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ModelApi, NoPush, PushChannel};
use crate::feed::ChangeFeed;
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::observable::{Observable, SubscriptionGuard};
use crate::pipeline::{GcReport, PublishOutcome, UpdatePipeline};
use crate::registry::{SubscriptionHandle, Transition};
use crate::sync::SyncState;
use crate::transport::TransportCoordinator;

/// Builder for [`ModelCache`].
pub struct ModelCacheBuilder<M: Model> {
    api: Arc<dyn ModelApi<M>>,
    push: Arc<dyn PushChannel<M>>,
    config: CacheConfig,
}

impl<M: Model> ModelCacheBuilder<M> {
    pub fn with_push(mut self, push: Arc<dyn PushChannel<M>>) -> Self {
        self.push = push;
        self
    }

    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> ReflexResult<ModelCache<M>> {
        self.config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let pipeline = Arc::new(UpdatePipeline::new(self.config.change_buffer, Arc::clone(&metrics)));
        let coordinator = TransportCoordinator::new(
            self.api,
            self.push,
            Arc::clone(&pipeline),
            self.config.clone(),
            Arc::clone(&metrics),
        );
        let (releases, release_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(release_loop(
            Arc::clone(&coordinator),
            Arc::clone(&pipeline),
            self.config.release_grace_period,
            release_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(gc_loop(Arc::clone(&pipeline), self.config.clone(), shutdown_rx));

        info!(
            entity = M::entity_name(),
            push = self.config.push_enabled,
            max_items = self.config.max_items,
            "Model cache started"
        );

        Ok(ModelCache {
            inner: Arc::new(CacheInner {
                config: self.config,
                pipeline,
                coordinator,
                metrics,
                releases,
                shutdown,
            }),
        })
    }
}

struct CacheInner<M: Model> {
    config: CacheConfig,
    pipeline: Arc<UpdatePipeline<M>>,
    coordinator: Arc<TransportCoordinator<M>>,
    metrics: Arc<CacheMetrics>,
    releases: mpsc::UnboundedSender<SubscriptionHandle<M::Id>>,
    shutdown: watch::Sender<bool>,
}

impl<M: Model> Drop for CacheInner<M> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.coordinator.stop_all();
    }
}

/// Reactive cache for one model type.
///
/// Cheap to clone; clones share the same store and background tasks.
pub struct ModelCache<M: Model> {
    inner: Arc<CacheInner<M>>,
}

impl<M: Model> Clone for ModelCache<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model> ModelCache<M> {
    pub fn builder(api: Arc<dyn ModelApi<M>>) -> ModelCacheBuilder<M> {
        ModelCacheBuilder {
            api,
            push: Arc::new(NoPush),
            config: CacheConfig::default(),
        }
    }

    /// Cache with default configuration and no push channel.
    pub fn new(api: Arc<dyn ModelApi<M>>) -> ReflexResult<Self> {
        Self::builder(api).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn default_freshness(&self) -> Freshness {
        Freshness::best_effort(self.inner.config.default_freshness)
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn ensure_running(&self) -> ReflexResult<()> {
        if self.is_shut_down() {
            Err(ReflexError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            CacheMetrics::incr(&self.inner.metrics.cache_hits);
        } else {
            CacheMetrics::incr(&self.inner.metrics.cache_misses);
        }
    }

    // ========================================================================
    // OBSERVE
    // ========================================================================

    /// Observe one item with the default freshness.
    ///
    /// The value is `None` until the first fetch completes, or when the
    /// item does not exist.
    pub fn observe_item(&self, id: M::Id) -> Observable<Option<M>> {
        self.observe_item_with(id, self.default_freshness())
    }

    pub fn observe_item_with(&self, id: M::Id, freshness: Freshness) -> Observable<Option<M>> {
        let key = InterestKey::Item(id.clone());
        let now = Utc::now();
        let (rx, handle, fresh, tightened) = self.inner.pipeline.with_state(|s| {
            let (handle, _) = s.registry.acquire(key.clone());
            let entry = s.items.entry(id.clone(), Instant::now());
            let tightened = entry.require(freshness);
            (entry.subscribe(), handle, entry.is_fresh(freshness, now), tightened)
        });
        self.record_lookup(fresh);

        if !self.is_shut_down() {
            let started = self.inner.coordinator.start_sync(Interest::Item(id.clone()));
            if tightened && !started {
                self.inner.coordinator.retune_sync(&key);
            }
            if !fresh {
                self.inner.coordinator.fetch_item(id, None);
            }
        }
        Observable::with_guard(rx, SubscriptionGuard::new(handle, self.inner.releases.clone()))
    }

    /// Observe a query result with the default freshness.
    pub fn observe_query(&self, spec: QuerySpec) -> Observable<Vec<M>> {
        self.observe_query_with(spec, self.default_freshness())
    }

    pub fn observe_query_with(&self, spec: QuerySpec, freshness: Freshness) -> Observable<Vec<M>> {
        let key = InterestKey::Query(spec.key());
        let now = Utc::now();
        let (rx, handle, fresh, tightened) = self.inner.pipeline.with_state(|s| {
            let (handle, _) = s.registry.acquire(key.clone());
            let query = s.queries.entry(&spec, Instant::now());
            let tightened = query.require(freshness);
            (query.subscribe(), handle, query.is_fresh(freshness, now), tightened)
        });
        self.record_lookup(fresh);

        if !self.is_shut_down() {
            let started = self.inner.coordinator.start_sync(Interest::Query(spec.clone()));
            if tightened && !started {
                self.inner.coordinator.retune_sync(&key);
            }
            if !fresh {
                self.inner.coordinator.fetch_query(spec, None);
            }
        }
        Observable::with_guard(rx, SubscriptionGuard::new(handle, self.inner.releases.clone()))
    }

    // ========================================================================
    // READ
    // ========================================================================

    /// Read one item, serving the cached value if it satisfies `freshness`.
    ///
    /// When the fetch fails and an older value is cached, the older value is
    /// returned with its original fetch time. Without a cached value the
    /// error is returned.
    pub async fn read_item(&self, id: &M::Id, freshness: Freshness) -> ReflexResult<CacheRead<Option<M>>> {
        self.ensure_running()?;
        let now = Utc::now();
        let cached: Option<(Option<M>, Timestamp, bool)> = self.inner.pipeline.with_state(|s| {
            let entry = s.items.entry(id.clone(), Instant::now());
            entry
                .fetched_at()
                .map(|fetched_at| (entry.value().cloned(), fetched_at, entry.is_fresh(freshness, now)))
        });

        if let Some((value, fetched_at, true)) = &cached {
            self.record_lookup(true);
            return Ok(CacheRead::from_cache(value.clone(), *fetched_at));
        }
        self.record_lookup(false);

        let not_before = freshness.is_consistent().then_some(now);
        match self.inner.coordinator.fetch_item(id.clone(), not_before).wait().await {
            Ok(value) => Ok(CacheRead::from_server(value, Utc::now())),
            Err(err) => match cached {
                Some((value, fetched_at, _)) => {
                    warn!(
                        entity = M::entity_name(),
                        id = %id,
                        error = %err,
                        "Fetch failed, serving stale value"
                    );
                    Ok(CacheRead::from_cache(value, fetched_at))
                }
                None => Err(err),
            },
        }
    }

    pub async fn get_item(&self, id: &M::Id, freshness: Freshness) -> ReflexResult<Option<M>> {
        self.read_item(id, freshness).await.map(CacheRead::into_value)
    }

    /// Read a query result, serving the cached one if it satisfies `freshness`.
    pub async fn read_query(&self, spec: &QuerySpec, freshness: Freshness) -> ReflexResult<CacheRead<Vec<M>>> {
        self.ensure_running()?;
        let now = Utc::now();
        let cached: Option<(Vec<M>, Timestamp, bool)> = self.inner.pipeline.with_state(|s| {
            let items = &s.items;
            let query = s.queries.entry(spec, Instant::now());
            let fetched_at = query.fetched_at()?;
            // A result that cannot be materialized is treated as missing.
            let values = query.materialize(items).ok()?;
            Some((values, fetched_at, query.is_fresh(freshness, now)))
        });

        if let Some((values, fetched_at, true)) = &cached {
            self.record_lookup(true);
            return Ok(CacheRead::from_cache(values.clone(), *fetched_at));
        }
        self.record_lookup(false);

        let not_before = freshness.is_consistent().then_some(now);
        match self.inner.coordinator.fetch_query(spec.clone(), not_before).wait().await {
            Ok(values) => Ok(CacheRead::from_server(values, Utc::now())),
            Err(err) => match cached {
                Some((values, fetched_at, _)) => {
                    warn!(
                        entity = M::entity_name(),
                        query = %spec.key(),
                        error = %err,
                        "Query failed, serving stale result"
                    );
                    Ok(CacheRead::from_cache(values, fetched_at))
                }
                None => Err(err),
            },
        }
    }

    pub async fn list(&self, spec: &QuerySpec, freshness: Freshness) -> ReflexResult<Vec<M>> {
        self.read_query(spec, freshness).await.map(CacheRead::into_value)
    }

    // ========================================================================
    // WRITE
    // ========================================================================

    fn apply_confirmed(&self, event: ChangeEvent<M>) {
        CacheMetrics::incr(&self.inner.metrics.mutations);
        let outcome = self.inner.pipeline.publish(event, UpdateSource::Mutation);
        self.inner.coordinator.follow_up(outcome);
    }

    fn write_failed(&self, operation: &str, err: &ReflexError) {
        warn!(
            entity = M::entity_name(),
            operation,
            error = %err,
            "Write rejected, cache unchanged"
        );
    }

    /// Replace an item on the server and apply the confirmed value.
    pub async fn set(&self, id: M::Id, value: M) -> ReflexResult<M> {
        self.ensure_running()?;
        let coordinator = &self.inner.coordinator;
        match coordinator.call("replace", coordinator.api().replace(&id, value)).await {
            Ok(confirmed) => {
                self.apply_confirmed(ChangeEvent::upserted(confirmed.clone()));
                Ok(confirmed)
            }
            Err(err) => {
                self.write_failed("replace", &err);
                Err(err)
            }
        }
    }

    /// Apply a partial update on the server and apply the confirmed value.
    pub async fn modify(&self, id: M::Id, delta: M::Delta) -> ReflexResult<M> {
        self.ensure_running()?;
        let coordinator = &self.inner.coordinator;
        match coordinator.call("update", coordinator.api().update(&id, delta)).await {
            Ok(confirmed) => {
                self.apply_confirmed(ChangeEvent::upserted(confirmed.clone()));
                Ok(confirmed)
            }
            Err(err) => {
                self.write_failed("update", &err);
                Err(err)
            }
        }
    }

    /// Create an item on the server and apply the confirmed value.
    pub async fn insert(&self, value: M) -> ReflexResult<M> {
        self.ensure_running()?;
        let coordinator = &self.inner.coordinator;
        match coordinator.call("insert", coordinator.api().insert(value)).await {
            Ok(confirmed) => {
                self.apply_confirmed(ChangeEvent::upserted(confirmed.clone()));
                Ok(confirmed)
            }
            Err(err) => {
                self.write_failed("insert", &err);
                Err(err)
            }
        }
    }

    /// Delete an item on the server and remove it from the cache.
    pub async fn delete(&self, id: M::Id) -> ReflexResult<()> {
        self.ensure_running()?;
        let coordinator = &self.inner.coordinator;
        match coordinator.call("delete", coordinator.api().delete(&id)).await {
            Ok(()) => {
                self.apply_confirmed(ChangeEvent::Removed(id));
                Ok(())
            }
            Err(err) => {
                self.write_failed("delete", &err);
                Err(err)
            }
        }
    }

    // ========================================================================
    // CONTROL
    // ========================================================================

    /// Fetch an item now, regardless of freshness.
    pub async fn refresh_item(&self, id: M::Id) -> ReflexResult<Option<M>> {
        self.ensure_running()?;
        self.inner.coordinator.fetch_item(id, Some(Utc::now())).wait().await
    }

    /// Run a query now, regardless of freshness.
    pub async fn refresh_query(&self, spec: QuerySpec) -> ReflexResult<Vec<M>> {
        self.ensure_running()?;
        self.inner.coordinator.fetch_query(spec, Some(Utc::now())).wait().await
    }

    /// Apply an externally sourced change, such as one learned from another
    /// channel the application listens to.
    pub fn publish(&self, event: ChangeEvent<M>) -> PublishOutcome<M::Id> {
        let outcome = self.inner.pipeline.publish(event, UpdateSource::Manual);
        self.inner.coordinator.follow_up(outcome.clone());
        outcome
    }

    /// Drop every cached value and refetch whatever is still observed.
    pub fn invalidate_all(&self) {
        let outcome = self.publish(ChangeEvent::Cleared);
        debug!(
            entity = M::entity_name(),
            active = outcome.refetch.len(),
            "Cache cleared, refetching observed regions"
        );
    }

    pub fn subscribe_changes(&self) -> ChangeFeed<M> {
        ChangeFeed::new(self.inner.pipeline.subscribe())
    }

    /// Run one eviction sweep now.
    pub fn collect_garbage(&self) -> GcReport {
        self.inner.pipeline.collect_garbage(&self.inner.config)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn sync_state(&self, key: &InterestKey<M::Id>) -> Option<SyncState> {
        self.inner.coordinator.sync_state(key)
    }

    /// Watch sync state transitions for an observed interest.
    pub fn watch_sync(&self, key: &InterestKey<M::Id>) -> Option<watch::Receiver<SyncState>> {
        self.inner.coordinator.watch_sync(key)
    }

    /// Number of interests with an active sync driver.
    pub fn active_syncs(&self) -> usize {
        self.inner.coordinator.active_drivers()
    }

    /// Number of live observers of `key`.
    pub fn observer_count(&self, key: &InterestKey<M::Id>) -> usize {
        self.inner.pipeline.with_state(|s| s.registry.count(key))
    }

    /// Stop background sync and refuse further reads and writes.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!(entity = M::entity_name(), "Model cache shutting down");
        }
        self.inner.coordinator.stop_all();
    }
}

async fn release_loop<M: Model>(
    coordinator: Arc<TransportCoordinator<M>>,
    pipeline: Arc<UpdatePipeline<M>>,
    grace: Duration,
    mut releases: mpsc::UnboundedReceiver<SubscriptionHandle<M::Id>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            handle = releases.recv() => {
                let Some(handle) = handle else { break };
                if pipeline.with_state(|s| s.registry.release(&handle)) != Transition::LastReleased {
                    continue;
                }
                let coordinator = Arc::clone(&coordinator);
                let key = handle.key().clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    coordinator.stop_sync_if_idle(&key);
                });
            }
        }
    }
}

async fn gc_loop<M: Model>(
    pipeline: Arc<UpdatePipeline<M>>,
    config: CacheConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(config.gc_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                pipeline.collect_garbage(&config);
            }
        }
    }
}
