//! Integration tests for observers, derived values, the change feed,
//! invalidation and eviction.

mod support;

use std::sync::Arc;
use std::time::Duration;

use reflex_cache::{ChangeEvent, FeedItem, Freshness, InterestKey, ModelCache, SyncState};
use reflex_test_utils::{fixtures, MockPushChannel, User, UserPatch};
use support::{api, cache, cache_with_config, cache_with_push, id, settle, within};
use tokio_stream::StreamExt;

fn live() -> Freshness {
    Freshness::best_effort(Duration::from_secs(1))
}

fn names(users: &[User]) -> Vec<String> {
    users.iter().map(|u| u.name.clone()).collect()
}

async fn until_push_active(cache: &ModelCache<User>, key: &InterestKey<String>) {
    let mut state = cache.watch_sync(key).unwrap();
    within(state.wait_for(SyncState::is_push_active)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_computed_over_two_items() {
    let api = api();
    let cache = cache(&api);
    let ann = cache.observe_item(id("U1"));
    let bob = cache.observe_item(id("U2"));
    settle().await;

    let mut total_age = ann.combine(bob, |a: &Option<User>, b: &Option<User>| {
        a.as_ref().map_or(0, |u| u.age) + b.as_ref().map_or(0, |u| u.age)
    });
    assert_eq!(*total_age.get(), 50);
    assert_eq!(total_age.evaluations(), 1);

    cache.modify(id("U1"), UserPatch::age(25)).await.unwrap();
    cache.modify(id("U2"), UserPatch::age(35)).await.unwrap();

    assert!(total_age.is_stale());
    assert_eq!(*total_age.get(), 60);
    assert_eq!(total_age.evaluations(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_derived_value_keeps_subscription_alive() {
    let api = api();
    let cache = cache(&api);
    let key = InterestKey::Query(fixtures::adults_by_name().key());

    let count = cache
        .observe_query(fixtures::adults_by_name())
        .map(|users: &Vec<User>| users.len());
    settle().await;
    assert_eq!(cache.observer_count(&key), 1);

    drop(count);
    settle().await;
    assert_eq!(cache.observer_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn test_observable_stream_yields_updates() {
    let api = api();
    let cache = cache(&api);
    let item = cache.observe_item(id("U3"));
    settle().await;

    let mut stream = item.into_stream();
    assert_eq!(stream.next().await, Some(Some(fixtures::cid())));

    cache.modify(id("U3"), UserPatch::name("Cyd")).await.unwrap();
    let next = within(stream.next()).await.flatten();
    assert_eq!(next.map(|u| u.name), Some("Cyd".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_all_refetches_observed_regions() {
    let api = api();
    let cache = cache(&api);
    let mut item = cache.observe_item(id("U1"));
    settle().await;
    cache.get_item(&id("U2"), Freshness::best_effort(Duration::from_secs(30))).await.unwrap();
    let fetches_before = api.fetch_calls();

    api.put_direct(fixtures::ann().renamed("Annie"));
    let mut feed = cache.subscribe_changes();
    cache.invalidate_all();

    assert_eq!(feed.try_next(), Some(FeedItem::Event(ChangeEvent::Cleared)));
    let value = within(item.wait_for(|u| u.as_ref().is_some_and(|u| u.name == "Annie")))
        .await
        .unwrap();
    assert!(value.is_some());
    // Only the observed item is refetched.
    assert_eq!(api.fetch_calls(), fetches_before + 1);
    assert_eq!(api.requested_batches().last(), Some(&vec![id("U1")]));
}

// ============================================================================
// PUBLISHED INVALIDATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_published_item_invalidation_refetches_observed_item() {
    let api = api();
    let push = Arc::new(MockPushChannel::auto_confirm());
    let cache = cache_with_push(&api, &push);
    let key = InterestKey::Item(id("U1"));

    let mut item = cache.observe_item_with(id("U1"), live());
    until_push_active(&cache, &key).await;
    within(item.wait_for(|u| u.is_some())).await.unwrap();
    settle().await;
    let fetches = api.fetch_calls();

    api.put_direct(fixtures::ann().renamed("Annie"));
    let outcome = cache.publish(ChangeEvent::Invalidated(key.clone()));

    assert_eq!(outcome.refetch, vec![key]);
    assert_eq!(item.get(), None);
    let value = within(item.wait_for(|u| u.as_ref().is_some_and(|u| u.name == "Annie")))
        .await
        .unwrap();
    assert_eq!(value.map(|u| u.age), Some(20));
    assert_eq!(api.fetch_calls(), fetches + 1);
}

#[tokio::test(start_paused = true)]
async fn test_published_query_invalidation_refetches_observed_query() {
    let api = api();
    let push = Arc::new(MockPushChannel::auto_confirm());
    let cache = cache_with_push(&api, &push);
    let spec = fixtures::adults_by_name();
    let key = InterestKey::Query(spec.key());

    let mut query = cache.observe_query_with(spec, live());
    until_push_active(&cache, &key).await;
    settle().await;
    assert_eq!(query.get().len(), 3);
    let queries = api.query_calls();

    api.put_direct(User::new("U5", "Ada", 40));
    cache.publish(ChangeEvent::Invalidated(key));

    assert!(query.get().is_empty());
    let result = within(query.wait_for(|users| users.len() == 4)).await.unwrap();
    assert_eq!(names(&result), vec!["Ada", "Ann", "Bob", "Cid"]);
    assert_eq!(api.query_calls(), queries + 1);
}

#[tokio::test(start_paused = true)]
async fn test_published_clear_refetches_every_observed_region() {
    let api = api();
    let push = Arc::new(MockPushChannel::auto_confirm());
    let cache = cache_with_push(&api, &push);
    let spec = fixtures::adults_by_name();
    let item_key = InterestKey::Item(id("U2"));
    let query_key = InterestKey::Query(spec.key());

    let mut item = cache.observe_item_with(id("U2"), live());
    let mut query = cache.observe_query_with(spec, live());
    until_push_active(&cache, &item_key).await;
    until_push_active(&cache, &query_key).await;
    settle().await;
    let (fetches, queries) = (api.fetch_calls(), api.query_calls());

    api.put_direct(fixtures::bob().aged(31));
    let outcome = cache.publish(ChangeEvent::Cleared);

    assert_eq!(outcome.refetch.len(), 2);
    assert_eq!(item.get(), None);
    assert!(query.get().is_empty());
    within(item.wait_for(|u| u.as_ref().is_some_and(|u| u.age == 31)))
        .await
        .unwrap();
    let result = within(query.wait_for(|users| users.len() == 3)).await.unwrap();
    assert_eq!(names(&result), vec!["Ann", "Bob", "Cid"]);
    assert_eq!(api.fetch_calls(), fetches + 1);
    assert_eq!(api.query_calls(), queries + 1);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_feed_consumer_is_told() {
    let api = api();
    let cache = cache_with_config(&api, fixtures::test_config().with_change_buffer(2));
    let mut feed = cache.subscribe_changes();

    for age in 30..35 {
        cache.publish(ChangeEvent::upserted(fixtures::bob().aged(age)));
    }

    assert_eq!(feed.next().await, Some(FeedItem::Lagged(3)));
    let event = feed.next_event().await.unwrap();
    assert_eq!(event, ChangeEvent::upserted(fixtures::bob().aged(33)));
}

// ============================================================================
// EVICTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lru_evicts_least_recently_used_unobserved_item() {
    let api = api();
    let cache = cache_with_config(&api, fixtures::test_config().with_capacity(2, 10));
    let relaxed = Freshness::best_effort(Duration::from_secs(30));

    let _observed = cache.observe_item(id("U3"));
    settle().await;
    cache.get_item(&id("U1"), relaxed).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    cache.get_item(&id("U2"), relaxed).await.unwrap();

    let report = cache.collect_garbage();
    assert_eq!(report.items_evicted, 1);
    assert_eq!(cache.metrics().evictions, 1);

    let fetches = api.fetch_calls();
    assert!(cache.read_item(&id("U2"), relaxed).await.unwrap().was_cache_hit());
    assert!(!cache.read_item(&id("U1"), relaxed).await.unwrap().was_cache_hit());
    assert_eq!(api.fetch_calls(), fetches + 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_entries_are_swept_but_observed_ones_stay() {
    let api = api();
    let cache = cache_with_config(&api, fixtures::test_config().with_idle_ttl(Duration::from_secs(5)));
    let relaxed = Freshness::best_effort(Duration::from_secs(30));

    let observed = cache.observe_item(id("U3"));
    cache.get_item(&id("U1"), relaxed).await.unwrap();
    cache.list(&fixtures::adults_by_name(), relaxed).await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let report = cache.collect_garbage();

    assert_eq!(report.queries_evicted, 1);
    // U1 and U2 were only referenced by the evicted query and the one-shot read.
    assert_eq!(report.items_evicted, 2);
    assert_eq!(observed.get(), Some(fixtures::cid()));
}
