//! Integration tests for the read path: deduplication, batching,
//! cancellation and failure handling.

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reflex_cache::{ChangeEvent, FeedItem, Freshness, ReflexError, TransportError};
use reflex_test_utils::{fixtures, MockModelApi};
use support::{api, cache, cache_with_config, id, settle, within};

fn relaxed() -> Freshness {
    Freshness::best_effort(Duration::from_secs(30))
}

// ============================================================================
// DEDUPLICATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_share_one_fetch() {
    let api = api();
    let cache = cache(&api);
    let target = id("U1");

    let reads = join_all((0..5).map(|_| cache.get_item(&target, relaxed()))).await;

    assert_eq!(api.fetch_calls(), 1);
    for read in reads {
        assert_eq!(read, Ok(Some(fixtures::ann())));
    }
    assert_eq!(cache.metrics().dedup_hits, 4);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_value_served_without_network() {
    let api = api();
    let cache = cache(&api);

    let first = cache.read_item(&id("U1"), relaxed()).await.unwrap();
    assert!(!first.was_cache_hit());
    let second = cache.read_item(&id("U1"), relaxed()).await.unwrap();
    assert!(second.was_cache_hit());
    assert_eq!(second.into_value(), Some(fixtures::ann()));

    assert_eq!(api.fetch_calls(), 1);
    let metrics = cache.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_consistent_read_always_goes_to_server() {
    let api = api();
    let cache = cache(&api);

    cache.get_item(&id("U1"), relaxed()).await.unwrap();
    api.put_direct(fixtures::ann().renamed("Annie"));
    let value = cache.get_item(&id("U1"), Freshness::consistent()).await.unwrap();

    assert_eq!(value.map(|u| u.name), Some("Annie".to_string()));
    assert_eq!(api.fetch_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_queries_share_one_round_trip() {
    let api = api();
    let cache = cache(&api);
    let spec = fixtures::adults_by_name();

    let results = join_all((0..3).map(|_| cache.list(&spec, relaxed()))).await;

    assert_eq!(api.query_calls(), 1);
    for result in results {
        let names: Vec<_> = result.unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["Ann", "Bob", "Cid"]);
    }
}

// ============================================================================
// BATCHING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_requests_within_window_are_batched() {
    let api = api();
    let cache = cache(&api);

    let a = cache.observe_item(id("U3"));
    let b = cache.observe_item(id("U1"));
    let c = cache.observe_item(id("U2"));
    settle().await;

    assert_eq!(api.requested_batches(), vec![vec![id("U1"), id("U2"), id("U3")]]);
    assert_eq!(a.get(), Some(fixtures::cid()));
    assert_eq!(b.get(), Some(fixtures::ann()));
    assert_eq!(c.get(), Some(fixtures::bob()));
    assert_eq!(cache.metrics().item_fetches, 1);
    assert_eq!(cache.metrics().batched_ids, 3);
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_is_sent_immediately() {
    let api = api();
    let cache = cache_with_config(&api, fixtures::test_config().with_max_batch_size(2));

    let _a = cache.observe_item(id("U1"));
    let _b = cache.observe_item(id("U2"));
    let _c = cache.observe_item(id("U3"));
    settle().await;

    assert_eq!(
        api.requested_batches(),
        vec![vec![id("U1"), id("U2")], vec![id("U3")]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_item_resolves_to_none() {
    let api = api();
    let cache = cache(&api);

    let observer = cache.observe_item(id("U404"));
    settle().await;

    assert_eq!(observer.get(), None);
    assert_eq!(cache.get_item(&id("U404"), relaxed()).await, Ok(None));
    assert_eq!(api.fetch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_item_never_cached_is_not_reported_removed() {
    let api = api();
    let cache = cache(&api);
    let mut feed = cache.subscribe_changes();

    let _known = cache.observe_item(id("U1"));
    let unknown = cache.observe_item(id("U404"));
    settle().await;

    assert_eq!(api.requested_batches(), vec![vec![id("U1"), id("U404")]]);
    assert_eq!(
        feed.try_next(),
        Some(FeedItem::Event(ChangeEvent::Upserted(id("U1"), fixtures::ann())))
    );
    assert_eq!(feed.try_next(), None);
    assert_eq!(unknown.get(), None);

    // A record the cache held is reported once it disappears.
    api.remove_direct("U1");
    assert_eq!(cache.refresh_item(id("U1")).await, Ok(None));
    assert_eq!(
        feed.try_next(),
        Some(FeedItem::Event(ChangeEvent::Removed(id("U1"))))
    );
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_abandoned_request_is_never_sent() {
    let api = api();
    let cache = cache(&api);

    drop(cache.observe_item(id("U1")));
    settle().await;

    assert_eq!(api.fetch_calls(), 0);
    assert_eq!(cache.metrics().cancelled_requests, 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_serves_stale_value() {
    let api = api();
    let cache = cache(&api);
    cache.get_item(&id("U1"), relaxed()).await.unwrap();

    api.fail("get");
    let read = cache.read_item(&id("U1"), Freshness::consistent()).await.unwrap();

    assert!(read.was_cache_hit());
    assert_eq!(read.into_value(), Some(fixtures::ann()));
    assert_eq!(cache.metrics().fetch_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_without_cached_value_is_surfaced() {
    let api = api();
    let cache = cache(&api);
    api.fail("get");

    let result = cache.get_item(&id("U2"), relaxed()).await;

    assert!(matches!(
        result,
        Err(ReflexError::Transport(TransportError::Network { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_times_out() {
    let api = Arc::new(MockModelApi::with_users(fixtures::users()));
    api.set_latency(Duration::from_secs(5));
    let cache = cache(&api);

    let result = within(cache.get_item(&id("U1"), relaxed())).await;

    assert_eq!(
        result,
        Err(ReflexError::Transport(TransportError::Timeout {
            operation: "get".to_string(),
            after: Duration::from_secs(1),
        }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_cache_rejects_reads() {
    let api = api();
    let cache = cache(&api);
    cache.shutdown();

    assert_eq!(
        cache.get_item(&id("U1"), relaxed()).await,
        Err(ReflexError::ShuttingDown)
    );
    assert_eq!(api.fetch_calls(), 0);
}
