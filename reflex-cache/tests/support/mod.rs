//! Shared setup for cache integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reflex_cache::{CacheConfig, ModelCache};
use reflex_test_utils::{fixtures, MockModelApi, MockPushChannel, User};

pub fn id(value: &str) -> String {
    value.to_string()
}

pub fn api() -> Arc<MockModelApi> {
    Arc::new(MockModelApi::with_users(fixtures::users()))
}

pub fn cache(api: &Arc<MockModelApi>) -> ModelCache<User> {
    cache_with_config(api, fixtures::test_config())
}

pub fn cache_with_config(api: &Arc<MockModelApi>, config: CacheConfig) -> ModelCache<User> {
    ModelCache::<User>::builder(api.clone())
        .with_config(config)
        .build()
        .expect("test config is valid")
}

pub fn cache_with_push(api: &Arc<MockModelApi>, push: &Arc<MockPushChannel>) -> ModelCache<User> {
    ModelCache::<User>::builder(api.clone())
        .with_push(push.clone())
        .with_config(fixtures::test_config())
        .build()
        .expect("test config is valid")
}

/// Let coalescing windows elapse and spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Await `future`, failing the test if it takes unreasonably long.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(120), future)
        .await
        .expect("condition not reached in time")
}
