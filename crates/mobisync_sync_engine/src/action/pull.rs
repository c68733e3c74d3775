use super::cursor::PullCursor;
use super::strategy::PullStrategy;
use super::{ActionCompletion, ActionLifecycle, DirtyTable, TableAction};
use crate::error::{SyncError, SyncResult};
use crate::queue::OperationQueue;
use crate::remote::{Parameters, ReadResponse, RemoteTable, SystemProperties};
use crate::settings::SettingsStore;
use async_trait::async_trait;
use mobisync_core::{is_tombstone, row_id, row_updated_at, LocalStore, QueryDescription, Row};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Counters of one pull.
///
/// Each item is counted once, even when paging by delta token reads the
/// rows at the token again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullStats {
    /// Pages fetched.
    pub pages: u64,
    /// Rows written to the store.
    pub upserted: u64,
    /// Rows removed because the server reported them deleted.
    pub deleted: u64,
    /// Rows left alone because the item has a queued local change.
    pub skipped: u64,
}

/// Fetches remote rows for one table and applies them to the local store.
pub struct PullAction {
    lifecycle: ActionLifecycle,
    table: RemoteTable,
    store: Arc<dyn LocalStore>,
    settings: Arc<dyn SettingsStore>,
    queue: Arc<OperationQueue>,
    query: QueryDescription,
    query_id: Option<String>,
    parameters: Parameters,
    page_size: u64,
    ordered: bool,
    pending: Option<ActionCompletion>,
    stats: PullStats,
    counted: HashSet<String>,
}

impl PullAction {
    /// Creates a pull of `query` from `table`.
    ///
    /// A non-empty `query_id` makes the pull incremental.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: RemoteTable,
        store: Arc<dyn LocalStore>,
        settings: Arc<dyn SettingsStore>,
        queue: Arc<OperationQueue>,
        query: QueryDescription,
        query_id: Option<String>,
        parameters: Parameters,
        page_size: u64,
        ordered: bool,
        token: CancellationToken,
    ) -> Self {
        Self {
            lifecycle: ActionLifecycle::new("pull", token),
            table,
            store,
            settings,
            queue,
            query,
            query_id: query_id.filter(|id| !id.is_empty()),
            parameters,
            page_size,
            ordered,
            pending: None,
            stats: PullStats::default(),
            counted: HashSet::new(),
        }
    }

    /// Makes the pull wait for another action (usually a push) first.
    #[must_use]
    pub fn after(mut self, pending: Option<ActionCompletion>) -> Self {
        self.pending = pending;
        self
    }

    /// Counters so far.
    pub fn stats(&self) -> PullStats {
        self.stats
    }

    fn validate(&self) -> SyncResult<()> {
        if self.query_id.is_none() {
            return Ok(());
        }
        if !self.query.ordering.is_empty() {
            return Err(SyncError::invalid_operation(
                "incremental pull query must not have an ordering",
            ));
        }
        if self.query.skip.is_some() {
            return Err(SyncError::invalid_operation(
                "incremental pull query must not have a skip",
            ));
        }
        Ok(())
    }

    async fn process_page(
        &mut self,
        response: &ReadResponse,
        cursor: &mut PullCursor,
        strategy: &mut PullStrategy,
    ) -> SyncResult<()> {
        let mut upserts: Vec<Row> = Vec::new();
        let mut deletes: Vec<String> = Vec::new();

        for row in &response.rows {
            if !cursor.on_next() {
                break;
            }
            let Some(id) = row_id(row) else {
                continue;
            };
            let first_sight = self.counted.insert(id.to_string());
            // A queued local change wins until it is pushed. The token stays
            // behind it so the row is fetched again afterwards.
            if self.queue.get_by_item(&self.query.table, id).is_some() {
                if first_sight {
                    self.stats.skipped += 1;
                }
                continue;
            }
            if let Some(updated_at) = row_updated_at(row) {
                strategy.set_updated_at(updated_at);
            }
            if is_tombstone(row) {
                deletes.push(id.to_string());
                if first_sight {
                    self.stats.deleted += 1;
                }
            } else {
                upserts.push(row.clone());
                if first_sight {
                    self.stats.upserted += 1;
                }
            }
        }

        self.store.upsert(&self.query.table, &upserts, true).await?;
        self.store.delete(&self.query.table, &deletes).await?;

        self.stats.pages += 1;
        debug!(
            table = %self.query.table,
            upserted = upserts.len(),
            deleted = deletes.len(),
            "applied page"
        );

        strategy.on_results_processed(self.settings.as_ref()).await
    }
}

fn end_of_result(cursor: &PullCursor, response: &ReadResponse) -> bool {
    cursor.complete() || response.rows.is_empty()
}

#[async_trait]
impl TableAction for PullAction {
    fn table(&self) -> &str {
        &self.query.table
    }

    fn lifecycle(&self) -> &ActionLifecycle {
        &self.lifecycle
    }

    async fn wait_for_pending(&mut self) -> SyncResult<()> {
        if let Some(mut pending) = self.pending.take() {
            let state = pending.wait().await;
            debug!(table = %self.query.table, ?state, "pending action finished");
        }
        Ok(())
    }

    async fn handle_dirty_table(&mut self, _queue: &OperationQueue) -> SyncResult<DirtyTable> {
        Ok(DirtyTable::Defer)
    }

    async fn process_table(&mut self) -> SyncResult<()> {
        self.validate()?;

        let features = self.table.features();
        let mut query = self.query.clone();
        query.include_deleted = true;
        let mut cursor = PullCursor::new(&query);

        let mut strategy = match &self.query_id {
            Some(query_id) => {
                self.table = self
                    .table
                    .clone()
                    .with_system_properties(SystemProperties::UPDATED_AT);
                PullStrategy::incremental(self.page_size, features, &query, query_id.clone(), self.ordered)
            }
            None => PullStrategy::bounded(self.page_size, features),
        };
        strategy
            .initialize(&mut query, &cursor, self.settings.as_ref())
            .await?;

        info!(
            table = %query.table,
            query_id = self.query_id.as_deref().unwrap_or(""),
            "pull starting"
        );

        loop {
            self.lifecycle.check_cancelled()?;
            let mut response = self.table.read(&query, &self.parameters).await?;
            self.process_page(&response, &mut cursor, &mut strategy).await?;

            while features.next_links && !end_of_result(&cursor, &response) {
                let Some(link) = response.next_link.take() else {
                    break;
                };
                self.lifecycle.check_cancelled()?;
                response = self.table.read_link(&link).await?;
                self.process_page(&response, &mut cursor, &mut strategy).await?;
            }

            if end_of_result(&cursor, &response) {
                break;
            }
            self.lifecycle.check_cancelled()?;
            if !strategy
                .move_to_next_page(&mut query, &mut cursor, self.settings.as_ref())
                .await?
            {
                break;
            }
        }

        strategy.pull_complete(self.settings.as_ref()).await?;
        info!(
            table = %query.table,
            pages = self.stats.pages,
            upserted = self.stats.upserted,
            deleted = self.stats.deleted,
            "pull complete"
        );
        Ok(())
    }
}

impl std::fmt::Debug for PullAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullAction")
            .field("table", &self.query.table)
            .field("query_id", &self.query_id)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
