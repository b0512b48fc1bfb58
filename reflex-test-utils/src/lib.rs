//! REFLEX Test Utilities
//!
//! Centralized test infrastructure for the REFLEX workspace:
//! - A sample `User` model
//! - In-memory mock model API and push channel
//! - Proptest generators
//! - Test fixtures for common scenarios

pub use reflex_cache::{ModelApi, PushChannel, PushSubscription};
pub use reflex_core::{
    CacheConfig, ChangeNotification, FilterExpr, Freshness, Interest, InterestKey, Model, OrderBy,
    PushMessage, QuerySpec, ReflexError, ReflexResult, Timestamp, TransportError,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reflex_cache::ApiResult;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// SAMPLE MODEL
// ============================================================================

/// Minimal record used throughout the tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub age: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>, name: impl Into<String>, age: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            age,
            team: None,
        }
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn aged(mut self, age: u32) -> Self {
        self.age = age;
        self
    }

    pub fn on_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }
}

/// Partial update for [`User`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPatch {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub team: Option<Option<String>>,
}

impl UserPatch {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn age(age: u32) -> Self {
        Self {
            age: Some(age),
            ..Self::default()
        }
    }

    pub fn apply(&self, user: &mut User) {
        if let Some(name) = &self.name {
            user.name = name.clone();
        }
        if let Some(age) = self.age {
            user.age = age;
        }
        if let Some(team) = &self.team {
            user.team = team.clone();
        }
    }
}

impl Model for User {
    type Id = String;
    type Delta = UserPatch;

    fn entity_name() -> &'static str {
        "user"
    }

    fn id(&self) -> String {
        self.id.clone()
    }
}

// ============================================================================
// MOCK MODEL API
// ============================================================================

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct CallCounts {
    pub get: AtomicUsize,
    pub get_many: AtomicUsize,
    pub query: AtomicUsize,
    pub insert: AtomicUsize,
    pub replace: AtomicUsize,
    pub update: AtomicUsize,
    pub delete: AtomicUsize,
}

/// In-memory stand-in for the remote model API.
///
/// Records live in a sorted map. Operations can be made to fail or to take
/// a fixed time, which tests combine with paused tokio time.
#[derive(Debug, Default)]
pub struct MockModelApi {
    records: Mutex<BTreeMap<String, User>>,
    failing: Mutex<HashSet<&'static str>>,
    latency: Mutex<Duration>,
    batches: Mutex<Vec<Vec<String>>>,
    pub calls: CallCounts,
}

impl MockModelApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let api = Self::new();
        for user in users {
            api.put_direct(user);
        }
        api
    }

    /// Change a record on the server without going through the cache.
    pub fn put_direct(&self, user: User) {
        lock(&self.records).insert(user.id.clone(), user);
    }

    /// Delete a record on the server without going through the cache.
    pub fn remove_direct(&self, id: &str) -> Option<User> {
        lock(&self.records).remove(id)
    }

    pub fn record(&self, id: &str) -> Option<User> {
        lock(&self.records).get(id).cloned()
    }

    /// Make `operation` ("get", "get_many", "query", "insert", ...) fail.
    pub fn fail(&self, operation: &'static str) {
        lock(&self.failing).insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        lock(&self.failing).remove(operation);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Identity sets requested by each `get` / `get_many` call, in order.
    pub fn requested_batches(&self) -> Vec<Vec<String>> {
        lock(&self.batches).clone()
    }

    /// Total item fetch round trips.
    pub fn fetch_calls(&self) -> usize {
        self.calls.get.load(Ordering::SeqCst) + self.calls.get_many.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.calls.query.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.calls.insert.load(Ordering::SeqCst)
            + self.calls.replace.load(Ordering::SeqCst)
            + self.calls.update.load(Ordering::SeqCst)
            + self.calls.delete.load(Ordering::SeqCst)
    }

    async fn begin(&self, operation: &'static str, counter: &AtomicUsize) -> ApiResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if lock(&self.failing).contains(operation) {
            return Err(TransportError::network(operation, "injected failure"));
        }
        Ok(())
    }

    fn not_found(id: &str) -> TransportError {
        TransportError::NotFound {
            entity: User::entity_name().to_string(),
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl ModelApi<User> for MockModelApi {
    async fn get(&self, id: &String) -> ApiResult<Option<User>> {
        lock(&self.batches).push(vec![id.clone()]);
        self.begin("get", &self.calls.get).await?;
        Ok(self.record(id))
    }

    async fn get_many(&self, ids: &[String]) -> ApiResult<HashMap<String, User>> {
        lock(&self.batches).push(ids.to_vec());
        self.begin("get_many", &self.calls.get_many).await?;
        let records = lock(&self.records);
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|user| (id.clone(), user.clone())))
            .collect())
    }

    async fn query(&self, spec: &QuerySpec) -> ApiResult<Vec<User>> {
        self.begin("query", &self.calls.query).await?;
        let records: Vec<User> = lock(&self.records).values().cloned().collect();
        Ok(spec.evaluate(records))
    }

    async fn insert(&self, value: User) -> ApiResult<User> {
        self.begin("insert", &self.calls.insert).await?;
        let mut records = lock(&self.records);
        if records.contains_key(&value.id) {
            return Err(TransportError::rejected("insert", format!("{} already exists", value.id)));
        }
        records.insert(value.id.clone(), value.clone());
        Ok(value)
    }

    async fn replace(&self, id: &String, value: User) -> ApiResult<User> {
        self.begin("replace", &self.calls.replace).await?;
        lock(&self.records).insert(id.clone(), value.clone());
        Ok(value)
    }

    async fn update(&self, id: &String, delta: UserPatch) -> ApiResult<User> {
        self.begin("update", &self.calls.update).await?;
        let mut records = lock(&self.records);
        let user = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        delta.apply(user);
        Ok(user.clone())
    }

    async fn delete(&self, id: &String) -> ApiResult<()> {
        self.begin("delete", &self.calls.delete).await?;
        lock(&self.records)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }
}

// ============================================================================
// MOCK PUSH CHANNEL
// ============================================================================

/// How the mock push channel answers subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Confirm every subscription immediately.
    AutoConfirm,
    /// Accept subscriptions but wait for [`MockPushChannel::confirm`].
    Manual,
    /// Report push as unavailable.
    Unavailable,
}

#[derive(Debug)]
struct PushSession {
    interest: InterestKey<String>,
    tx: mpsc::Sender<PushMessage<User>>,
}

/// In-memory stand-in for the server push channel.
#[derive(Debug)]
pub struct MockPushChannel {
    mode: Mutex<PushMode>,
    sessions: Mutex<Vec<PushSession>>,
    opened: watch::Sender<usize>,
}

impl MockPushChannel {
    pub fn new(mode: PushMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            sessions: Mutex::new(Vec::new()),
            opened: watch::Sender::new(0),
        }
    }

    pub fn auto_confirm() -> Self {
        Self::new(PushMode::AutoConfirm)
    }

    pub fn manual() -> Self {
        Self::new(PushMode::Manual)
    }

    pub fn unavailable() -> Self {
        Self::new(PushMode::Unavailable)
    }

    pub fn set_mode(&self, mode: PushMode) {
        *lock(&self.mode) = mode;
    }

    /// Subscriptions opened so far, including closed ones.
    pub fn subscribe_count(&self) -> usize {
        *self.opened.borrow()
    }

    /// Subscriptions whose receiver is still alive.
    pub fn live_sessions(&self) -> usize {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|session| !session.tx.is_closed());
        sessions.len()
    }

    /// Wait until at least `count` subscriptions were opened.
    pub async fn wait_for_subscriptions(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }

    fn send_where(&self, matches: impl Fn(&InterestKey<String>) -> bool, message: PushMessage<User>) -> usize {
        let mut sessions = lock(&self.sessions);
        sessions.retain(|session| !session.tx.is_closed());
        sessions
            .iter()
            .filter(|session| matches(&session.interest))
            .filter(|session| session.tx.try_send(message.clone()).is_ok())
            .count()
    }

    /// Confirm pending subscriptions for `key` as active from now.
    pub fn confirm(&self, key: &InterestKey<String>) -> usize {
        self.confirm_at(key, Utc::now())
    }

    pub fn confirm_at(&self, key: &InterestKey<String>, active_at: Timestamp) -> usize {
        self.send_where(|interest| interest == key, PushMessage::Connected { active_at })
    }

    /// Deliver a change to every live subscription.
    pub fn notify(&self, notification: ChangeNotification<User>) -> usize {
        self.send_where(|_| true, PushMessage::Notification(notification))
    }

    /// Signal that updates for `key` were dropped.
    pub fn overload(&self, key: &InterestKey<String>) -> usize {
        self.send_where(|interest| interest == key, PushMessage::Overloaded)
    }

    /// Close every subscription for `key`.
    pub fn disconnect(&self, key: &InterestKey<String>) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|session| &session.interest != key);
        before - sessions.len()
    }
}

#[async_trait]
impl PushChannel<User> for MockPushChannel {
    fn is_available(&self) -> bool {
        *lock(&self.mode) != PushMode::Unavailable
    }

    async fn subscribe(&self, interest: &Interest<String>) -> ApiResult<PushSubscription<User>> {
        let mode = *lock(&self.mode);
        if mode == PushMode::Unavailable {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::channel(64);
        if mode == PushMode::AutoConfirm {
            tx.try_send(PushMessage::Connected {
                active_at: Utc::now(),
            })
            .map_err(|_| TransportError::Closed)?;
        }
        lock(&self.sessions).push(PushSession {
            interest: interest.key(),
            tx,
        });
        self.opened.send_modify(|opened| *opened += 1);
        Ok(rx)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_user_id() -> impl Strategy<Value = String> {
        (0u8..20).prop_map(|n| format!("U{n:02}"))
    }

    pub fn arb_name() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["Ann", "Bea", "Cid", "Dee", "Eve", "Fay", "Gus", "Hal"])
            .prop_map(str::to_string)
    }

    pub fn arb_user() -> impl Strategy<Value = User> {
        (arb_user_id(), arb_name(), 0u32..80).prop_map(|(id, name, age)| User::new(id, name, age))
    }

    /// Users with distinct identities.
    pub fn arb_users(max: usize) -> impl Strategy<Value = Vec<User>> {
        prop::collection::btree_map(arb_user_id(), (arb_name(), 0u32..80), 0..=max).prop_map(|users| {
            users
                .into_iter()
                .map(|(id, (name, age))| User::new(id, name, age))
                .collect()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::json;

    pub fn ann() -> User {
        User::new("U1", "Ann", 20)
    }

    pub fn bob() -> User {
        User::new("U2", "Bob", 30)
    }

    pub fn cid() -> User {
        User::new("U3", "Cid", 22)
    }

    pub fn minor() -> User {
        User::new("U4", "Kid", 12)
    }

    pub fn users() -> Vec<User> {
        vec![ann(), bob(), cid(), minor()]
    }

    /// Adults ordered by name.
    pub fn adults_by_name() -> QuerySpec {
        QuerySpec::new(FilterExpr::gte("age", json!(18))).with_order(OrderBy::asc("name"))
    }

    /// Configuration with short windows for tests running on paused time.
    pub fn test_config() -> CacheConfig {
        CacheConfig::default()
            .with_coalesce_window(Duration::from_millis(5))
            .with_fetch_timeout(Duration::from_secs(1))
            .with_push_connect_timeout(Duration::from_millis(500))
            .with_push_retry_interval(Duration::from_secs(10))
            .with_default_poll_interval(Duration::from_secs(2))
            .with_release_grace_period(Duration::from_millis(100))
            .with_backoff(Duration::from_millis(200), Duration::from_secs(2), 2.0)
    }
}
