use super::{ActionLifecycle, DirtyTable, TableAction};
use crate::error::{SyncError, SyncResult};
use crate::queue::OperationQueue;
use crate::settings::SettingsStore;
use async_trait::async_trait;
use mobisync_core::{LocalStore, QueryDescription};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Deletes local rows matching a query. Never talks to the remote.
pub struct PurgeAction {
    lifecycle: ActionLifecycle,
    store: Arc<dyn LocalStore>,
    settings: Arc<dyn SettingsStore>,
    query: QueryDescription,
    query_id: Option<String>,
    force: bool,
    removed: u64,
}

impl PurgeAction {
    /// Creates a purge. With `force`, pending operations of the table are
    /// discarded instead of blocking the purge.
    pub fn new(
        store: Arc<dyn LocalStore>,
        settings: Arc<dyn SettingsStore>,
        query: QueryDescription,
        query_id: Option<String>,
        force: bool,
        token: CancellationToken,
    ) -> Self {
        Self {
            lifecycle: ActionLifecycle::new("purge", token),
            store,
            settings,
            query,
            query_id: query_id.filter(|id| !id.is_empty()),
            force,
            removed: 0,
        }
    }

    /// Rows removed by the purge.
    pub fn removed(&self) -> u64 {
        self.removed
    }
}

#[async_trait]
impl TableAction for PurgeAction {
    fn table(&self) -> &str {
        &self.query.table
    }

    fn lifecycle(&self) -> &ActionLifecycle {
        &self.lifecycle
    }

    async fn handle_dirty_table(&mut self, queue: &OperationQueue) -> SyncResult<DirtyTable> {
        if !self.force {
            warn!(table = %self.query.table, "purge skipped: table has pending operations");
            return Ok(DirtyTable::Skip);
        }
        if self.query.filter.is_some() {
            return Err(SyncError::invalid_operation(
                "a table with pending operations can only be force-purged without a filter",
            ));
        }
        queue.delete_table(&self.query.table).await?;
        Ok(DirtyTable::Proceed)
    }

    async fn process_table(&mut self) -> SyncResult<()> {
        if let Some(query_id) = &self.query_id {
            self.settings
                .reset_delta_token(&self.query.table, query_id)
                .await?;
        }
        self.removed = self.store.delete_query(&self.query).await?;
        info!(table = %self.query.table, removed = self.removed, "purge complete");
        Ok(())
    }
}

impl std::fmt::Debug for PurgeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurgeAction")
            .field("table", &self.query.table)
            .field("query_id", &self.query_id)
            .field("force", &self.force)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{run_table_action, TableActionOutcome};
    use crate::operation::{OperationKind, TableKind};
    use crate::settings::SyncSettings;
    use chrono::{TimeZone, Utc};
    use mobisync_core::{Filter, MemoryStore};
    use serde_json::json;

    struct Setup {
        store: Arc<MemoryStore>,
        settings: Arc<SyncSettings>,
        queue: OperationQueue,
    }

    async fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let rows: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| json!({"id": id, "done": *id != "c"}).as_object().cloned().unwrap())
            .collect();
        store.upsert("todo", &rows, true).await.unwrap();
        Setup {
            settings: Arc::new(SyncSettings::new(store.clone())),
            queue: OperationQueue::load(store.clone()).await.unwrap(),
            store,
        }
    }

    fn purge(setup: &Setup, query: QueryDescription, force: bool) -> PurgeAction {
        PurgeAction::new(
            setup.store.clone(),
            setup.settings.clone(),
            query,
            Some("q".into()),
            force,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn purges_matching_rows_and_resets_token() {
        let setup = setup().await;
        let token = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        setup.settings.set_delta_token("todo", "q", token).await.unwrap();

        let query = QueryDescription::new("todo").with_filter(Filter::eq("done", true));
        let mut action = purge(&setup, query, false);
        let outcome = run_table_action(&mut action, &setup.queue).await.unwrap();

        assert_eq!(outcome, TableActionOutcome::Processed);
        assert_eq!(action.removed(), 2);
        assert_eq!(setup.store.row_count("todo"), 1);
        assert_eq!(
            setup.settings.delta_token("todo", "q").await.unwrap(),
            chrono::DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn dirty_table_is_skipped_unless_forced() {
        let setup = setup().await;
        setup
            .queue
            .enqueue("todo", TableKind::Table, "a", OperationKind::Update, None)
            .await
            .unwrap();

        let mut action = purge(&setup, QueryDescription::new("todo"), false);
        let outcome = run_table_action(&mut action, &setup.queue).await.unwrap();
        assert_eq!(outcome, TableActionOutcome::Skipped);
        assert_eq!(setup.store.row_count("todo"), 3);

        let filtered = QueryDescription::new("todo").with_filter(Filter::eq("done", true));
        let mut action = purge(&setup, filtered, true);
        assert!(matches!(
            run_table_action(&mut action, &setup.queue).await,
            Err(SyncError::InvalidOperation(_))
        ));

        let mut action = purge(&setup, QueryDescription::new("todo"), true);
        let outcome = run_table_action(&mut action, &setup.queue).await.unwrap();
        assert_eq!(outcome, TableActionOutcome::Processed);
        assert_eq!(setup.queue.pending_count(), 0);
        assert_eq!(setup.store.row_count("todo"), 0);
    }
}
