//! Property tests for query evaluation and the memory store.

use mobisync_core::{
    CompareOp, Filter, LocalStore, MemoryStore, QueryDescription, Row, SortDirection,
};
use proptest::prelude::*;
use serde_json::json;

fn rows_strategy() -> impl Strategy<Value = Vec<Row>> {
    prop::collection::btree_map("[a-z]{1,6}", (0i64..100, any::<bool>()), 0..30).prop_map(
        |entries| {
            entries
                .into_iter()
                .map(|(id, (score, deleted))| {
                    json!({"id": id, "score": score, "deleted": deleted})
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn paging_is_a_slice_of_the_ordered_result(
        rows in rows_strategy(),
        threshold in 0i64..100,
        skip in 0u64..10,
        top in 0u64..10,
    ) {
        let base = QueryDescription::new("t")
            .with_filter(Filter::compare("score", CompareOp::Ge, threshold))
            .order_by("score", SortDirection::Descending)
            .order_by("id", SortDirection::Ascending);

        let all = base.apply(rows.iter());
        let page = base.clone().with_skip(skip).with_top(top).apply(rows.iter());

        let expected: Vec<Row> = all
            .iter()
            .skip(skip as usize)
            .take(top as usize)
            .cloned()
            .collect();
        prop_assert_eq!(page, expected);

        for pair in all.windows(2) {
            prop_assert!(pair[0]["score"].as_i64() >= pair[1]["score"].as_i64());
        }
        prop_assert!(all.iter().all(|r| r["deleted"] == json!(false)));
    }

    #[test]
    fn negation_partitions_live_rows(rows in rows_strategy(), threshold in 0i64..100) {
        let filter = Filter::lt("score", threshold);
        let matched = QueryDescription::new("t").with_filter(filter.clone()).apply(rows.iter());
        let rest = QueryDescription::new("t").with_filter(filter.not()).apply(rows.iter());
        let live = QueryDescription::new("t").apply(rows.iter());
        prop_assert_eq!(matched.len() + rest.len(), live.len());
    }
}

#[tokio::test]
async fn delete_query_removes_exactly_the_matches() {
    let store = MemoryStore::new();
    let rows: Vec<Row> = (0..10)
        .map(|i| json!({"id": format!("r{i}"), "score": i}).as_object().cloned().unwrap())
        .collect();
    store.upsert("t", &rows, true).await.unwrap();

    let query = QueryDescription::new("t").with_filter(Filter::ge("score", 7));
    assert_eq!(store.delete_query(&query).await.unwrap(), 3);
    assert_eq!(store.row_count("t"), 7);
    assert!(store.read(&query).await.unwrap().is_empty());
}
