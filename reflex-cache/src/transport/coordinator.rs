//! Transport coordinator: batched, deduplicated fetches and sync drivers.
//!
//! Item fetches requested within the coalescing window are merged into one
//! `get_many` round trip; a full batch is sent immediately. Concurrent
//! requests for the same identity or query share one [`PendingRequest`].
//! Every API call runs under a bounded permit pool and a timeout.

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reflex_core::{
    CacheConfig, Freshness, Interest, InterestKey, Model, QueryKey, QuerySpec,
    ReflexError, ReflexResult, Timestamp, TransportError,
};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ApiResult, ModelApi, PushChannel};
use crate::metrics::CacheMetrics;
use crate::pipeline::{PublishOutcome, UpdatePipeline};
use crate::sync::{DriverHandle, SyncDriver, SyncPolicy, SyncState};

use super::pending::{PendingRequest, Waiter};

struct ItemBatch<M: Model> {
    queued: Vec<(M::Id, PendingRequest<Option<M>>)>,
    timer_armed: bool,
}

impl<M: Model> Default for ItemBatch<M> {
    fn default() -> Self {
        Self {
            queued: Vec::new(),
            timer_armed: false,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct TransportCoordinator<M: Model> {
    api: Arc<dyn ModelApi<M>>,
    push: Arc<dyn PushChannel<M>>,
    pipeline: Arc<UpdatePipeline<M>>,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
    permits: Semaphore,
    pending_items: DashMap<M::Id, PendingRequest<Option<M>>>,
    pending_queries: DashMap<QueryKey, PendingRequest<Vec<M>>>,
    batch: Mutex<ItemBatch<M>>,
    drivers: Mutex<HashMap<InterestKey<M::Id>, DriverHandle>>,
    closed: AtomicBool,
}

impl<M: Model> TransportCoordinator<M> {
    pub fn new(
        api: Arc<dyn ModelApi<M>>,
        push: Arc<dyn PushChannel<M>>,
        pipeline: Arc<UpdatePipeline<M>>,
        config: CacheConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            push,
            pipeline,
            permits: Semaphore::new(config.max_in_flight.max(1)),
            config,
            metrics,
            pending_items: DashMap::new(),
            pending_queries: DashMap::new(),
            batch: Mutex::new(ItemBatch::default()),
            drivers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn api(&self) -> &dyn ModelApi<M> {
        self.api.as_ref()
    }

    pub(crate) fn push(&self) -> Arc<dyn PushChannel<M>> {
        Arc::clone(&self.push)
    }

    pub(crate) fn pipeline(&self) -> &Arc<UpdatePipeline<M>> {
        &self.pipeline
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    // ========================================================================
    // API CALLS
    // ========================================================================

    /// Run one API call under the in-flight limit and the fetch timeout.
    pub async fn call<T>(
        &self,
        operation: &'static str,
        request: impl Future<Output = ApiResult<T>>,
    ) -> ReflexResult<T> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ReflexError::ShuttingDown)?;
        let started = Instant::now();

        match tokio::time::timeout(self.config.fetch_timeout, request).await {
            Ok(Ok(value)) => {
                debug!(
                    entity = M::entity_name(),
                    operation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "API call completed"
                );
                Ok(value)
            }
            Ok(Err(err)) => {
                debug!(
                    entity = M::entity_name(),
                    operation,
                    error = %err,
                    "API call failed"
                );
                Err(err.into())
            }
            Err(_) => Err(TransportError::Timeout {
                operation: operation.to_string(),
                after: self.config.fetch_timeout,
            }
            .into()),
        }
    }

    // ========================================================================
    // ITEM FETCHES
    // ========================================================================

    /// Request `id`, joining an in-flight request unless it was created
    /// before `not_before`.
    pub fn fetch_item(self: &Arc<Self>, id: M::Id, not_before: Option<Timestamp>) -> Waiter<Option<M>> {
        let (waiter, request) = match self.pending_items.entry(id.clone()) {
            Entry::Occupied(entry)
                if not_before.map_or(true, |at| entry.get().created_at() >= at) =>
            {
                CacheMetrics::incr(&self.metrics.dedup_hits);
                return entry.get().waiter();
            }
            Entry::Occupied(mut entry) => {
                let request = PendingRequest::new();
                let waiter = request.waiter();
                entry.insert(request.clone());
                (waiter, request)
            }
            Entry::Vacant(entry) => {
                let request = PendingRequest::new();
                let waiter = request.waiter();
                entry.insert(request.clone());
                (waiter, request)
            }
        };
        self.enqueue(id, request);
        waiter
    }

    fn enqueue(self: &Arc<Self>, id: M::Id, request: PendingRequest<Option<M>>) {
        let (full, arm_timer) = {
            let mut batch = lock(&self.batch);
            batch.queued.push((id, request));
            if batch.queued.len() >= self.config.max_batch_size {
                (Some(mem::take(&mut batch.queued)), false)
            } else if !batch.timer_armed {
                batch.timer_armed = true;
                (None, true)
            } else {
                (None, false)
            }
        };

        if let Some(queued) = full {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch_items(queued).await });
        } else if arm_timer {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.config.coalesce_window).await;
                let queued = {
                    let mut batch = lock(&this.batch);
                    batch.timer_armed = false;
                    mem::take(&mut batch.queued)
                };
                this.dispatch_items(queued).await;
            });
        }
    }

    async fn dispatch_items(self: Arc<Self>, queued: Vec<(M::Id, PendingRequest<Option<M>>)>) {
        let mut live = Vec::with_capacity(queued.len());
        for (id, request) in queued {
            let subscribed = self
                .pipeline
                .with_state(|s| s.registry.is_active(&InterestKey::Item(id.clone())));
            if request.has_waiters() || subscribed {
                live.push((id, request));
            } else {
                CacheMetrics::incr(&self.metrics.cancelled_requests);
                debug!(entity = M::entity_name(), id = %id, "Dropped fetch nobody is waiting for");
                self.pending_items.remove_if(&id, |_, current| current.same_as(&request));
            }
        }
        if live.is_empty() {
            return;
        }

        let mut ids: Vec<M::Id> = live.iter().map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids.dedup();
        CacheMetrics::incr(&self.metrics.item_fetches);
        CacheMetrics::add(&self.metrics.batched_ids, ids.len() as u64);

        let snapshot_at = Utc::now();
        let result = match ids.as_slice() {
            [id] => self
                .call("get", self.api.get(id))
                .await
                .map(|found| found.map(|value| (id.clone(), value)).into_iter().collect()),
            _ => self.call("get_many", self.api.get_many(&ids)).await,
        };

        match result {
            Ok(found) => {
                let outcome = self.pipeline.apply_item_fetch(&ids, found, snapshot_at);
                self.follow_up(outcome);

                for (id, request) in live {
                    let current = self.pipeline.with_state(|s| s.items.value(&id));
                    request.complete(Ok(current));
                    self.pending_items.remove_if(&id, |_, c| c.same_as(&request));
                }
            }
            Err(err) => {
                CacheMetrics::incr(&self.metrics.fetch_failures);
                warn!(
                    entity = M::entity_name(),
                    ids = ids.len(),
                    error = %err,
                    "Item fetch failed"
                );
                for (id, request) in live {
                    request.complete(Err(err.clone()));
                    self.pending_items.remove_if(&id, |_, c| c.same_as(&request));
                }
            }
        }
    }

    // ========================================================================
    // QUERY FETCHES
    // ========================================================================

    /// Request a query result, joining an in-flight request for the same
    /// query unless it was created before `not_before`.
    pub fn fetch_query(self: &Arc<Self>, spec: QuerySpec, not_before: Option<Timestamp>) -> Waiter<Vec<M>> {
        let request = match self.pending_queries.entry(spec.key()) {
            Entry::Occupied(entry)
                if not_before.map_or(true, |at| entry.get().created_at() >= at) =>
            {
                CacheMetrics::incr(&self.metrics.dedup_hits);
                return entry.get().waiter();
            }
            Entry::Occupied(mut entry) => {
                let request = PendingRequest::new();
                entry.insert(request.clone());
                request
            }
            Entry::Vacant(entry) => {
                let request = PendingRequest::new();
                entry.insert(request.clone());
                request
            }
        };
        let waiter = request.waiter();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.config.coalesce_window).await;
            this.dispatch_query(spec, request).await;
        });
        waiter
    }

    async fn dispatch_query(self: Arc<Self>, spec: QuerySpec, request: PendingRequest<Vec<M>>) {
        let key = spec.key();
        let subscribed = self
            .pipeline
            .with_state(|s| s.registry.is_active(&InterestKey::Query(key.clone())));
        if !request.has_waiters() && !subscribed {
            CacheMetrics::incr(&self.metrics.cancelled_requests);
            debug!(entity = M::entity_name(), query = %key, "Dropped query nobody is waiting for");
            self.pending_queries.remove_if(&key, |_, c| c.same_as(&request));
            return;
        }

        CacheMetrics::incr(&self.metrics.query_fetches);
        let snapshot_at = Utc::now();
        match self.call("query", self.api.query(&spec)).await {
            Ok(values) => {
                let (outcome, result) = self.pipeline.apply_query_result(&spec, values, snapshot_at);
                self.follow_up(outcome);
                request.complete(Ok(result));
            }
            Err(err) => {
                CacheMetrics::incr(&self.metrics.fetch_failures);
                warn!(
                    entity = M::entity_name(),
                    query = %key,
                    error = %err,
                    "Query fetch failed"
                );
                request.complete(Err(err));
            }
        }
        self.pending_queries.remove_if(&key, |_, c| c.same_as(&request));
    }

    // ========================================================================
    // REFRESH
    // ========================================================================

    /// Act on regions a publish invalidated.
    pub fn follow_up(self: &Arc<Self>, outcome: PublishOutcome<M::Id>) {
        for key in outcome.refetch {
            self.refetch(&key);
        }
    }

    /// Start a new fetch of the region behind `key` without waiting for it.
    pub fn refetch(self: &Arc<Self>, key: &InterestKey<M::Id>) {
        let now = Utc::now();
        match key {
            InterestKey::Item(id) => {
                self.fetch_item(id.clone(), Some(now));
            }
            InterestKey::Query(query) => {
                if let Some(spec) = self.pipeline.with_state(|s| s.queries.spec(query)) {
                    self.fetch_query(spec, Some(now));
                }
            }
        }
    }

    /// Fetch the region behind `key` with a request made now, and wait for it.
    ///
    /// A query no longer in the store has nothing to refresh.
    pub async fn refresh(self: &Arc<Self>, key: &InterestKey<M::Id>) -> ReflexResult<()> {
        let now = Utc::now();
        match key {
            InterestKey::Item(id) => self.fetch_item(id.clone(), Some(now)).wait().await.map(|_| ()),
            InterestKey::Query(query) => {
                match self.pipeline.with_state(|s| s.queries.spec(query)) {
                    Some(spec) => self.fetch_query(spec, Some(now)).wait().await.map(|_| ()),
                    None => Ok(()),
                }
            }
        }
    }

    // ========================================================================
    // SYNC DRIVERS
    // ========================================================================

    /// Sync parameters for an interest, derived from the tightest freshness
    /// any observer asked for.
    pub fn sync_policy(&self, key: &InterestKey<M::Id>) -> SyncPolicy {
        let freshness = self
            .pipeline
            .with_state(|s| match key {
                InterestKey::Item(id) => s.items.get(id).and_then(|entry| entry.freshness()),
                InterestKey::Query(query) => s.queries.get(query).and_then(|query| query.freshness()),
            })
            .unwrap_or_else(|| Freshness::best_effort(self.config.default_freshness));
        let window = freshness.window();

        SyncPolicy {
            push_eligible: self.config.push_enabled
                && self.push.is_available()
                && window < self.config.push_threshold,
            poll_interval: if window.is_zero() {
                self.config.default_poll_interval
            } else {
                window
            },
            push_retry_interval: self.config.push_retry_interval,
        }
    }

    /// Start background sync for an interest. No-op if a driver is already running.
    pub fn start_sync(self: &Arc<Self>, interest: Interest<M::Id>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let key = interest.key();
        let mut drivers = lock(&self.drivers);
        if drivers.get(&key).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let (handle, driver) = SyncDriver::new(Arc::clone(self), interest);
        drivers.insert(key, handle);
        tokio::spawn(driver.run());
        true
    }

    /// Have a running driver re-derive its sync policy, after an observer
    /// asked for tighter freshness.
    pub fn retune_sync(&self, key: &InterestKey<M::Id>) -> bool {
        match lock(&self.drivers).get(key) {
            Some(handle) if !handle.is_finished() => {
                handle.retune();
                debug!(entity = M::entity_name(), interest = %key, "Freshness tightened, retuning sync");
                true
            }
            _ => false,
        }
    }

    /// Stop the driver for `key` if nobody observes it anymore.
    pub fn stop_sync_if_idle(&self, key: &InterestKey<M::Id>) -> bool {
        let mut drivers = lock(&self.drivers);
        let idle = self.pipeline.with_state(|s| !s.registry.is_active(key));
        if !idle {
            return false;
        }
        match drivers.remove(key) {
            Some(handle) => {
                handle.stop();
                debug!(entity = M::entity_name(), interest = %key, "Stopped sync for released interest");
                true
            }
            None => false,
        }
    }

    pub fn stop_sync(&self, key: &InterestKey<M::Id>) -> bool {
        match lock(&self.drivers).remove(key) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every driver and refuse to start new ones.
    pub fn stop_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drivers = mem::take(&mut *lock(&self.drivers));
        for handle in drivers.into_values() {
            handle.stop();
        }
    }

    pub fn sync_state(&self, key: &InterestKey<M::Id>) -> Option<SyncState> {
        lock(&self.drivers).get(key).map(DriverHandle::state)
    }

    pub fn watch_sync(&self, key: &InterestKey<M::Id>) -> Option<watch::Receiver<SyncState>> {
        lock(&self.drivers).get(key).map(DriverHandle::watch)
    }

    pub fn is_push_active(&self, key: &InterestKey<M::Id>) -> bool {
        self.sync_state(key).is_some_and(|state| state.is_push_active())
    }

    pub fn active_drivers(&self) -> usize {
        lock(&self.drivers).len()
    }
}
