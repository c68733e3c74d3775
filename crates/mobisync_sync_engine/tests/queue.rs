//! Integration tests for local writes and the operation queue.

use mobisync_core::QueryDescription;
use mobisync_sync_engine::{OperationKind, OperationState, SyncError};
use mobisync_testkit::prelude::*;
use proptest::prelude::*;

fn queue_of(sync: &TestSync) -> Vec<(String, OperationKind)> {
    sync.operations()
        .into_iter()
        .map(|op| (op.item_id, op.kind))
        .collect()
}

async fn local_ids(sync: &TestSync) -> Vec<String> {
    sync.read(&QueryDescription::new("todo"))
        .await
        .unwrap()
        .iter()
        .filter_map(|row| mobisync_core::row_id(row).map(str::to_string))
        .collect()
}

async fn apply(sync: &TestSync, mutation: &Mutation) -> Result<(), SyncError> {
    match mutation.kind {
        OperationKind::Insert => sync.insert("todo", mutation.row()).await.map(|_| ()),
        OperationKind::Update => sync.update("todo", mutation.row()).await,
        OperationKind::Delete => sync.delete("todo", &mutation.item_id).await,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn queue_matches_reference_model(mutations in mutations_strategy(24)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let sync = TestSync::new().await;
            let mut model = QueueModel::new();

            for mutation in &mutations {
                let expected = model.apply(mutation);
                let actual = apply(&sync, mutation).await;
                match expected {
                    ModelStep::Rejected => {
                        assert!(
                            matches!(actual, Err(SyncError::InvalidOperation(_))),
                            "{mutation:?} should be rejected, got {actual:?}"
                        );
                    }
                    _ => assert!(actual.is_ok(), "{mutation:?} failed: {actual:?}"),
                }
            }

            assert_eq!(queue_of(&sync), model.queue());
            assert_eq!(local_ids(&sync).await, model.rows());
            assert_eq!(sync.pending_operations() as usize, model.queue().len());

            let sync = sync.reopen().await;
            assert_eq!(queue_of(&sync), model.queue());
        });
    }
}

#[tokio::test]
async fn insert_generates_missing_id() {
    let sync = TestSync::new().await;
    let created = sync.insert("todo", row(serde_json::json!({"text": "milk"}))).await.unwrap();

    let id = mobisync_core::row_id(&created).unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(sync.operations()[0].item_id, id);
}

#[tokio::test]
async fn insert_of_existing_row_is_rejected() {
    let sync = TestSync::new().await;
    sync.insert("todo", item("a", "milk")).await.unwrap();
    sync.push().await.unwrap();

    let err = sync.insert("todo", item("a", "again")).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));
    assert_eq!(sync.pending_operations(), 0);
}

#[tokio::test]
async fn system_tables_are_off_limits() {
    let sync = TestSync::new().await;
    let err = sync.insert("__operations", item("a", "x")).await.unwrap_err();
    assert!(matches!(err, SyncError::InvalidOperation(_)));
}

#[tokio::test]
async fn update_after_insert_keeps_insert_and_position() {
    let sync = TestSync::new().await;
    sync.insert("todo", item("a", "milk")).await.unwrap();
    sync.insert("todo", item("b", "eggs")).await.unwrap();
    sync.update("todo", item("a", "oat milk")).await.unwrap();

    let ops = sync.operations();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].item_id, "a");
    assert_eq!(ops[0].kind, OperationKind::Insert);
    assert_eq!(ops[0].version, 2);
    assert_eq!(ops[0].state, OperationState::Pending);
}

#[tokio::test]
async fn delete_after_insert_cancels_both() {
    let sync = TestSync::new().await;
    sync.insert("todo", item("a", "milk")).await.unwrap();
    sync.delete("todo", "a").await.unwrap();

    assert_eq!(sync.pending_operations(), 0);
    assert!(sync.lookup("todo", "a").await.unwrap().is_none());
    assert_eq!(sync.store.row_count("__operations"), 0);
}

#[tokio::test]
async fn queue_survives_restart() {
    let sync = TestSync::file().await;
    sync.insert("todo", item("a", "milk")).await.unwrap();
    sync.insert("todo", item("b", "eggs")).await.unwrap();
    sync.delete("todo", "b").await.unwrap();
    sync.insert("todo", item("c", "bread")).await.unwrap();
    let before = sync.operations();

    let sync = sync.reopen().await;
    assert_eq!(sync.operations(), before);

    // New operations continue after the restored ones.
    sync.insert("todo", item("d", "jam")).await.unwrap();
    let ops = sync.operations();
    assert!(ops[2].sequence > ops[1].sequence);
    assert_eq!(ops[2].item_id, "d");

    sync.push().await.unwrap();
    let mut ids: Vec<_> = sync.remote.rows("todo").iter().map(|r| r["id"].clone()).collect();
    ids.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
    assert_eq!(ids, vec!["a", "c", "d"]);
}
