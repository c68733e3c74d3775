//! Integration tests for pulling remote changes.

use mobisync_core::{Filter, QueryDescription, SortDirection};
use mobisync_sync_engine::{
    Parameters, PullOptions, PullStats, RemoteError, RemoteFeatures, SettingsStore, SyncConfig,
    SyncError,
};
use mobisync_testkit::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn todo() -> QueryDescription {
    QueryDescription::new("todo")
}

fn seed(sync: &TestSync, count: usize) {
    sync.remote.seed(
        "todo",
        (0..count).map(|i| item(&format!("r{i:02}"), &format!("item {i}"))),
    );
}

async fn pull_paged(sync: &TestSync, query_id: Option<&str>, page_size: u64) -> PullStats {
    sync.pull_with_token(
        todo(),
        query_id,
        Parameters::new(),
        PullOptions::default().with_max_page_size(page_size),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn full_pull_copies_every_row() {
    let sync = TestSync::new().await;
    seed(&sync, 7);

    let stats = sync.pull(todo(), None, Parameters::new()).await.unwrap();
    assert_eq!(stats.upserted, 7);
    assert_eq!(sync.store.row_count("todo"), 7);
    assert_eq!(sync.store.local_writes(), 0);
}

#[tokio::test]
async fn bounded_pull_pages_with_skip() {
    let sync = TestSync::new().await;
    seed(&sync, 7);

    let stats = pull_paged(&sync, None, 3).await;
    assert_eq!(sync.store.row_count("todo"), 7);
    assert!(stats.pages >= 3);
}

#[tokio::test]
async fn next_links_are_followed() {
    let sync = TestSync::new().await;
    sync.remote.set_page_limit(2);
    seed(&sync, 5);

    sync.pull(todo(), None, Parameters::new()).await.unwrap();
    assert_eq!(sync.store.row_count("todo"), 5);
    let links = sync
        .remote
        .calls()
        .iter()
        .filter(|call| matches!(call, RemoteCall::ReadLink { .. }))
        .count();
    assert_eq!(links, 2);
}

#[tokio::test]
async fn top_limits_the_pull() {
    let sync = TestSync::new().await;
    seed(&sync, 10);

    let query = todo().order_by("id", SortDirection::Ascending).with_top(4);
    sync.pull(query, None, Parameters::new()).await.unwrap();
    assert_eq!(sync.store.row_count("todo"), 4);
    assert!(sync.lookup("todo", "r03").await.unwrap().is_some());
    assert!(sync.lookup("todo", "r04").await.unwrap().is_none());
}

#[tokio::test]
async fn server_deletes_remove_local_rows() {
    let sync = TestSync::new().await;
    seed(&sync, 3);
    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();

    sync.remote.remove("todo", "r01");
    let stats = sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();
    assert_eq!(stats.deleted, 1);
    assert!(sync.lookup("todo", "r01").await.unwrap().is_none());
    assert_eq!(sync.store.row_count("todo"), 2);
}

#[tokio::test]
async fn delta_token_tracks_the_newest_row() {
    let sync = TestSync::new().await;
    seed(&sync, 5);

    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();
    let first = sync.settings().delta_token("todo", "all").await.unwrap();
    assert_eq!(first, ts(5));

    // Nothing changed: the token stays put.
    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();
    assert_eq!(sync.settings().delta_token("todo", "all").await.unwrap(), first);

    sync.remote.edit("todo", "r02", row(json!({"text": "edited"})));
    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();
    let second = sync.settings().delta_token("todo", "all").await.unwrap();
    assert!(second > first);
    assert_eq!(
        sync.lookup("todo", "r02").await.unwrap().unwrap()["text"],
        json!("edited")
    );

    // The second pull only asked for rows at or after the token.
    let last_read = sync
        .remote
        .calls()
        .into_iter()
        .rev()
        .find(|call| matches!(call, RemoteCall::Read { .. }));
    let Some(RemoteCall::Read { query, .. }) = last_read else {
        panic!("no read recorded");
    };
    assert!(query.filter.is_some());
}

#[tokio::test]
async fn incremental_paging_advances_the_token() {
    let sync = TestSync::new().await;
    seed(&sync, 7);

    pull_paged(&sync, Some("paged"), 2).await;
    assert_eq!(sync.store.row_count("todo"), 7);
    assert_eq!(
        sync.settings().delta_token("todo", "paged").await.unwrap(),
        ts(7)
    );
}

#[tokio::test]
async fn unordered_incremental_pull_saves_at_the_end() {
    let sync = TestSync::new().await;
    sync.remote.set_features(
        "todo",
        RemoteFeatures {
            ordering: false,
            ..RemoteFeatures::default()
        },
    );
    seed(&sync, 4);

    pull_paged(&sync, Some("q"), 2).await;
    assert_eq!(sync.store.row_count("todo"), 4);
    assert_eq!(sync.settings().delta_token("todo", "q").await.unwrap(), ts(4));
}

#[tokio::test]
async fn query_ids_are_independent() {
    let sync = TestSync::new().await;
    seed(&sync, 3);

    let done = todo().with_filter(Filter::eq("text", "item 0"));
    sync.pull(done, Some("first"), Parameters::new()).await.unwrap();
    assert_eq!(sync.store.row_count("todo"), 1);
    assert_eq!(sync.settings().delta_token("todo", "first").await.unwrap(), ts(1));
    assert_eq!(
        sync.settings().delta_token("todo", "other").await.unwrap(),
        chrono::DateTime::<chrono::Utc>::UNIX_EPOCH
    );
}

#[tokio::test]
async fn incremental_pull_rejects_ordering() {
    let sync = TestSync::new().await;
    let query = todo().order_by("text", SortDirection::Descending);
    let err = sync.pull(query, Some("q"), Parameters::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));
}

#[tokio::test]
async fn dirty_table_is_pushed_before_pulling() {
    let sync = TestSync::new().await;
    seed(&sync, 2);
    sync.insert("todo", item("local", "mine")).await.unwrap();

    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();

    assert_eq!(sync.pending_operations(), 0);
    assert!(sync.remote.row("todo", "local").is_some());
    assert_eq!(sync.store.row_count("todo"), 3);
    let local = sync.lookup("todo", "local").await.unwrap().unwrap();
    assert_eq!(local["version"], json!("1"));
}

#[tokio::test]
async fn dirty_table_fails_when_push_fails() {
    let sync = TestSync::new().await;
    sync.insert("todo", item("local", "mine")).await.unwrap();
    sync.remote.fail_item("local", RemoteError::rejected(400, "invalid"));

    let err = sync.pull(todo(), None, Parameters::new()).await.unwrap_err();
    assert!(err.push_result().is_some());
    assert_eq!(sync.remote.reads(), 0);
}

#[tokio::test]
async fn dirty_table_without_deferrals_is_refused() {
    let sync = TestSync::with_config(SyncConfig::default().with_max_deferrals(0)).await;
    sync.insert("todo", item("local", "mine")).await.unwrap();

    let err = sync.pull(todo(), None, Parameters::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::TableDirty { .. }));
    assert!(sync.remote.mutations().is_empty());
}

#[tokio::test]
async fn network_failure_keeps_the_last_token() {
    let sync = TestSync::new().await;
    seed(&sync, 3);
    sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap();
    let token = sync.settings().delta_token("todo", "all").await.unwrap();

    sync.remote.edit("todo", "r00", row(json!({"text": "edited"})));
    sync.remote.go_offline();
    let err = sync.pull(todo(), Some("all"), Parameters::new()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(sync.settings().delta_token("todo", "all").await.unwrap(), token);
}

#[tokio::test]
async fn cancelled_pull_does_not_read() {
    let sync = TestSync::new().await;
    seed(&sync, 3);

    let token = CancellationToken::new();
    token.cancel();
    let err = sync
        .pull_with_token(todo(), None, Parameters::new(), PullOptions::default(), token)
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
    assert_eq!(sync.remote.reads(), 0);
}
