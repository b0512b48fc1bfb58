//! Integration tests for the write path.
//!
//! Writes go to the server first; only the confirmed result reaches the
//! cache, and it reaches every observer of the affected item and queries.

mod support;

use reflex_cache::{ChangeEvent, FeedItem, ReflexError, TransportError};
use reflex_test_utils::{fixtures, User, UserPatch};
use support::{api, cache, id, settle};

fn names(users: &[User]) -> Vec<String> {
    users.iter().map(|u| u.name.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_write_reaches_item_and_query_observers() {
    let api = api();
    let cache = cache(&api);
    let mut item = cache.observe_item(id("U1"));
    let query = cache.observe_query(fixtures::adults_by_name());
    settle().await;
    assert_eq!(names(&query.get()), vec!["Ann", "Bob", "Cid"]);
    item.wait_for(|u| u.is_some()).await.unwrap();

    let mut feed = cache.subscribe_changes();
    let confirmed = cache.set(id("U1"), fixtures::ann().renamed("Zed")).await.unwrap();

    assert_eq!(confirmed.name, "Zed");
    assert_eq!(item.changed().await.unwrap().map(|u| u.name), Some("Zed".to_string()));
    assert_eq!(names(&query.get()), vec!["Bob", "Cid", "Zed"]);
    assert_eq!(
        feed.try_next(),
        Some(FeedItem::Event(ChangeEvent::Upserted(id("U1"), confirmed)))
    );
    assert_eq!(cache.metrics().mutations, 1);
    // Observers were updated without another round trip.
    assert_eq!(api.query_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_write_leaves_cache_unchanged() {
    let api = api();
    let cache = cache(&api);
    let item = cache.observe_item(id("U1"));
    settle().await;

    api.fail("replace");
    let result = cache.set(id("U1"), fixtures::ann().renamed("Zed")).await;

    assert!(matches!(
        result,
        Err(ReflexError::Transport(TransportError::Network { .. }))
    ));
    assert_eq!(item.get(), Some(fixtures::ann()));
    assert_eq!(api.write_calls(), 1);
    assert_eq!(cache.metrics().mutations, 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_update_moves_item_out_of_query() {
    let api = api();
    let cache = cache(&api);
    let query = cache.observe_query(fixtures::adults_by_name());
    settle().await;

    let updated = cache.modify(id("U1"), UserPatch::age(15)).await.unwrap();

    assert_eq!(updated.age, 15);
    assert_eq!(names(&query.get()), vec!["Bob", "Cid"]);
}

#[tokio::test(start_paused = true)]
async fn test_insert_appears_in_matching_query() {
    let api = api();
    let cache = cache(&api);
    let query = cache.observe_query(fixtures::adults_by_name());
    settle().await;

    cache.insert(User::new("U5", "Ada", 41)).await.unwrap();

    assert_eq!(names(&query.get()), vec!["Ada", "Ann", "Bob", "Cid"]);
    assert_eq!(api.record("U5").map(|u| u.age), Some(41));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_insert_is_rejected() {
    let api = api();
    let cache = cache(&api);

    let result = cache.insert(fixtures::ann()).await;

    assert!(matches!(
        result,
        Err(ReflexError::Transport(TransportError::Rejected { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_delete_removes_from_item_and_query() {
    let api = api();
    let cache = cache(&api);
    let item = cache.observe_item(id("U2"));
    let query = cache.observe_query(fixtures::adults_by_name());
    settle().await;
    assert_eq!(item.get(), Some(fixtures::bob()));

    cache.delete(id("U2")).await.unwrap();

    assert_eq!(item.get(), None);
    assert_eq!(names(&query.get()), vec!["Ann", "Cid"]);
    assert_eq!(api.record("U2"), None);
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_unknown_item_is_surfaced() {
    let api = api();
    let cache = cache(&api);

    let result = cache.delete(id("U404")).await;

    assert!(matches!(
        result,
        Err(ReflexError::Transport(TransportError::NotFound { .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_external_change_is_applied() {
    let api = api();
    let cache = cache(&api);
    let item = cache.observe_item(id("U3"));
    settle().await;

    let outcome = cache.publish(ChangeEvent::upserted(fixtures::cid().aged(23)));

    assert_eq!(outcome.applied, 1);
    assert_eq!(item.get().map(|u| u.age), Some(23));
}
