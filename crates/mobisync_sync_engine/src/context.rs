//! Application-facing sync API.

use crate::action::{
    run_table_action, ActionCompletion, PullAction, PullStats, PurgeAction, PushAction,
    TableAction, TableActionOutcome,
};
use crate::config::{PullOptions, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::handler::{DefaultSyncHandler, SyncHandler};
use crate::operation::{OperationKind, OperationState, PendingOperation, TableKind};
use crate::operation_error::{OperationError, SyncErrorStore};
use crate::queue::OperationQueue;
use crate::remote::{Parameters, RemoteService, RemoteTable};
use crate::result::PushCompletionResult;
use crate::settings::{SettingsStore, SyncSettings};
use mobisync_core::{columns, row_id, system_tables, LocalStore, QueryDescription, Row};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Which queued operations a push drains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushFilter {
    /// Table kind to push.
    pub table_kind: TableKind,
    /// Tables to push; empty means all.
    pub tables: Vec<String>,
}

impl PushFilter {
    /// Every data table.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only the named data tables.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table_kind: TableKind::Table,
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    /// Sets the table kind.
    #[must_use]
    pub fn with_table_kind(mut self, table_kind: TableKind) -> Self {
        self.table_kind = table_kind;
        self
    }
}

/// Result of a purge request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// Matching rows were deleted.
    Purged {
        /// Rows removed.
        removed: u64,
    },
    /// The table has pending operations; push before purging.
    SkippedDirtyTable,
}

/// Builder for [`SyncContext`].
pub struct SyncContextBuilder {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    handler: Arc<dyn SyncHandler>,
    settings: Option<Arc<dyn SettingsStore>>,
    config: SyncConfig,
}

impl SyncContextBuilder {
    /// Sets the sync handler.
    pub fn with_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Replaces the default `__config`-backed settings.
    pub fn with_settings(mut self, settings: Arc<dyn SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Loads the operation queue and returns the context.
    pub async fn initialize(self) -> SyncResult<SyncContext> {
        self.config.validate()?;
        let queue = OperationQueue::load(Arc::clone(&self.store)).await?;
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(SyncSettings::new(Arc::clone(&self.store))));

        info!(pending = queue.pending_count(), "sync context initialized");

        Ok(SyncContext {
            errors: SyncErrorStore::new(Arc::clone(&self.store)),
            store: self.store,
            remote: self.remote,
            handler: self.handler,
            settings,
            queue: Arc::new(queue),
            config: self.config,
            active_push: Mutex::new(None),
            push_ids: AtomicU64::new(0),
        })
    }
}

/// Offline-first access to a local store kept in sync with a remote service.
///
/// Local writes go to the store immediately and are queued for the next
/// push. Pulls never overwrite items with queued changes, and a pull of a
/// table with queued changes pushes that table first.
pub struct SyncContext {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    handler: Arc<dyn SyncHandler>,
    settings: Arc<dyn SettingsStore>,
    queue: Arc<OperationQueue>,
    errors: SyncErrorStore,
    config: SyncConfig,
    active_push: Mutex<Option<(u64, ActionCompletion)>>,
    push_ids: AtomicU64,
}

impl SyncContext {
    /// Starts building a context over a local store and a remote service.
    pub fn builder(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
    ) -> SyncContextBuilder {
        SyncContextBuilder {
            store,
            remote,
            handler: Arc::new(DefaultSyncHandler),
            settings: None,
            config: SyncConfig::default(),
        }
    }

    /// Creates a context with the default handler and configuration.
    pub async fn initialize(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
    ) -> SyncResult<Self> {
        Self::builder(store, remote).initialize().await
    }

    /// The operation queue.
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// The local store.
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// The settings store.
    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.settings
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // Local writes

    /// Inserts a row locally and queues it. A missing id is generated.
    pub async fn insert(&self, table: &str, mut item: Row) -> SyncResult<Row> {
        check_table(table)?;
        let id = match row_id(&item) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                item.insert(columns::ID.into(), Value::String(id.clone()));
                id
            }
        };

        let _lock = self.queue.lock_item(&id).await;
        self.queue.validate(table, &id, OperationKind::Insert)?;
        if self.store.lookup(table, &id).await?.is_some() {
            return Err(SyncError::invalid_operation(format!(
                "item {id} already exists in table {table}"
            )));
        }

        self.store
            .upsert(table, std::slice::from_ref(&item), false)
            .await?;
        self.enqueue_or_restore(table, &id, OperationKind::Insert, None, None)
            .await?;
        Ok(item)
    }

    /// Updates a row locally and queues it.
    pub async fn update(&self, table: &str, item: Row) -> SyncResult<()> {
        check_table(table)?;
        let id = require_id(&item)?;

        let _lock = self.queue.lock_item(&id).await;
        self.queue.validate(table, &id, OperationKind::Update)?;
        let previous = self.store.lookup(table, &id).await?;

        self.store.upsert(table, &[item], false).await?;
        self.enqueue_or_restore(table, &id, OperationKind::Update, None, previous)
            .await
    }

    /// Deletes a row locally and queues the delete.
    pub async fn delete(&self, table: &str, id: &str) -> SyncResult<()> {
        check_table(table)?;

        let _lock = self.queue.lock_item(id).await;
        self.queue.validate(table, id, OperationKind::Delete)?;
        let previous = self.store.lookup(table, id).await?;
        let payload = previous.clone().unwrap_or_else(|| {
            let mut row = Row::new();
            row.insert(columns::ID.into(), Value::String(id.to_string()));
            row
        });

        self.store.delete(table, &[id.to_string()]).await?;
        self.enqueue_or_restore(table, id, OperationKind::Delete, Some(payload), previous)
            .await
    }

    async fn enqueue_or_restore(
        &self,
        table: &str,
        id: &str,
        kind: OperationKind,
        payload: Option<Row>,
        previous: Option<Row>,
    ) -> SyncResult<()> {
        let error = match self
            .queue
            .enqueue(table, TableKind::Table, id, kind, payload)
            .await
        {
            Ok(_) => return Ok(()),
            Err(error) => error,
        };

        // Put the row back so the store matches the queue again.
        let restored = match previous {
            Some(row) => match self.store.delete(table, &[id.to_string()]).await {
                Ok(()) => self.store.upsert(table, &[row], false).await,
                Err(e) => Err(e),
            },
            None => self.store.delete(table, &[id.to_string()]).await,
        };
        if let Err(restore_error) = restored {
            warn!(table, item_id = id, error = %restore_error, "failed to restore row after queue error");
        }
        Err(error)
    }

    /// Reads one row from the local store.
    pub async fn lookup(&self, table: &str, id: &str) -> SyncResult<Option<Row>> {
        Ok(self.store.lookup(table, id).await?)
    }

    /// Queries the local store.
    pub async fn read(&self, query: &QueryDescription) -> SyncResult<Vec<Row>> {
        Ok(self.store.read(query).await?)
    }

    // Push

    /// Pushes every queued data-table operation.
    pub async fn push(&self) -> SyncResult<PushCompletionResult> {
        self.push_with_token(&PushFilter::all(), CancellationToken::new())
            .await
    }

    /// Pushes the operations selected by `filter`.
    pub async fn push_tables(&self, filter: &PushFilter) -> SyncResult<PushCompletionResult> {
        self.push_with_token(filter, CancellationToken::new()).await
    }

    /// Pushes the operations selected by `filter` until the token fires.
    pub async fn push_with_token(
        &self,
        filter: &PushFilter,
        token: CancellationToken,
    ) -> SyncResult<PushCompletionResult> {
        let action = PushAction::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.remote),
            Arc::clone(&self.handler),
            self.errors.clone(),
            filter.table_kind,
            filter.tables.clone(),
            token,
        );

        let id = self.push_ids.fetch_add(1, Ordering::SeqCst);
        *self.active_push.lock() = Some((id, action.lifecycle().completion()));

        let result = action.execute().await;

        {
            let mut active = self.active_push.lock();
            if matches!(&*active, Some((current, _)) if *current == id) {
                *active = None;
            }
        }
        result
    }

    /// Like [`push_with_token`](Self::push_with_token), retrying pushes that
    /// a network error aborted when `push_retry_on_network` is enabled.
    pub async fn push_with_retry(
        &self,
        filter: &PushFilter,
        token: CancellationToken,
    ) -> SyncResult<PushCompletionResult> {
        let mut attempts = 0;
        loop {
            let error = match self.push_with_token(filter, token.clone()).await {
                Err(error) if self.config.push_retry_on_network => error,
                other => return other,
            };
            attempts += 1;
            let Some(delay) = self.config.retry.next_retry(attempts, &error) else {
                return Err(error);
            };
            warn!(attempts, ?delay, error = %error, "push aborted by network error, retrying");
            tokio::select! {
                _ = token.cancelled() => return Err(error),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn active_push(&self) -> Option<ActionCompletion> {
        self.active_push
            .lock()
            .as_ref()
            .map(|(_, completion)| completion.clone())
    }

    // Pull

    /// Pulls rows matching `query` into the local store.
    ///
    /// With a `query_id` the pull is incremental: only rows changed since the
    /// last pull of that id are fetched.
    pub async fn pull(
        &self,
        query: QueryDescription,
        query_id: Option<&str>,
        parameters: Parameters,
    ) -> SyncResult<PullStats> {
        self.pull_with_token(
            query,
            query_id,
            parameters,
            PullOptions::default(),
            CancellationToken::new(),
        )
        .await
    }

    /// Pulls with per-call options until the token fires.
    pub async fn pull_with_token(
        &self,
        query: QueryDescription,
        query_id: Option<&str>,
        parameters: Parameters,
        options: PullOptions,
        token: CancellationToken,
    ) -> SyncResult<PullStats> {
        check_table(&query.table)?;
        let table = query.table.clone();

        let mut action = PullAction::new(
            RemoteTable::new(table.clone(), Arc::clone(&self.remote)),
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            Arc::clone(&self.queue),
            query,
            query_id.map(str::to_string),
            parameters,
            options.page_size(&self.config),
            self.config.ordered_incremental_pull,
            token.clone(),
        )
        .after(self.active_push());

        let mut deferrals = 0;
        loop {
            match run_table_action(&mut action, &self.queue).await? {
                TableActionOutcome::Deferred => {
                    if deferrals >= self.config.max_deferrals {
                        let error = SyncError::TableDirty { table };
                        action.lifecycle().fail(&error);
                        return Err(error);
                    }
                    deferrals += 1;
                    info!(table = %table, "pushing pending operations before pull");
                    if let Err(error) = self
                        .push_with_token(&PushFilter::tables([table.clone()]), token.clone())
                        .await
                    {
                        action.lifecycle().fail(&error);
                        return Err(error);
                    }
                }
                TableActionOutcome::Processed | TableActionOutcome::Skipped => {
                    return Ok(action.stats());
                }
            }
        }
    }

    // Purge

    /// Deletes local rows matching `query` and forgets the query's delta
    /// token. A table with pending operations is left alone unless `force`
    /// is set, in which case its pending operations are discarded too.
    pub async fn purge(
        &self,
        query: QueryDescription,
        query_id: Option<&str>,
        force: bool,
    ) -> SyncResult<PurgeOutcome> {
        self.purge_with_token(query, query_id, force, CancellationToken::new())
            .await
    }

    /// Purges until the token fires.
    pub async fn purge_with_token(
        &self,
        query: QueryDescription,
        query_id: Option<&str>,
        force: bool,
        token: CancellationToken,
    ) -> SyncResult<PurgeOutcome> {
        check_table(&query.table)?;
        let mut action = PurgeAction::new(
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            query,
            query_id.map(str::to_string),
            force,
            token,
        );

        match run_table_action(&mut action, &self.queue).await? {
            TableActionOutcome::Processed => Ok(PurgeOutcome::Purged {
                removed: action.removed(),
            }),
            TableActionOutcome::Skipped | TableActionOutcome::Deferred => {
                Ok(PurgeOutcome::SkippedDirtyTable)
            }
        }
    }

    // Inspection

    /// Number of queued operations.
    pub fn pending_operations(&self) -> u64 {
        self.queue.pending_count()
    }

    /// Queued operations in push order.
    pub fn operations(&self) -> Vec<PendingOperation> {
        self.queue.operations()
    }

    /// Failures recorded by a push that did not get to acknowledge them.
    pub async fn sync_errors(&self) -> SyncResult<Vec<OperationError>> {
        self.errors.load().await
    }

    // Error resolution

    /// Drops the failed operation and stores `item` (usually the server copy)
    /// as the local row.
    pub async fn cancel_and_update_item(&self, error: &OperationError, item: Row) -> SyncResult<()> {
        check_item(error, &item)?;
        let _lock = self.queue.lock_item(&error.item_id).await;

        self.queue
            .delete(&error.operation_id, error.operation_version)
            .await?;
        self.store.upsert(&error.table, &[item], true).await?;
        self.errors.delete(&[error.id.clone()]).await?;
        debug!(table = %error.table, item_id = %error.item_id, "operation cancelled, item updated");
        Ok(())
    }

    /// Drops the failed operation and removes the local row.
    pub async fn cancel_and_discard_item(&self, error: &OperationError) -> SyncResult<()> {
        let _lock = self.queue.lock_item(&error.item_id).await;

        self.queue
            .delete(&error.operation_id, error.operation_version)
            .await?;
        self.store
            .delete(&error.table, &[error.item_id.clone()])
            .await?;
        self.errors.delete(&[error.id.clone()]).await?;
        debug!(table = %error.table, item_id = %error.item_id, "operation cancelled, item discarded");
        Ok(())
    }

    /// Keeps the failed operation queued with a corrected item, so the next
    /// push sends `item` instead.
    pub async fn update_operation(&self, error: &OperationError, item: Row) -> SyncResult<()> {
        check_item(error, &item)?;
        let _lock = self.queue.lock_item(&error.item_id).await;

        let mut op = match self.queue.get(&error.operation_id) {
            Some(op) if op.version == error.operation_version => op,
            _ => {
                return Err(SyncError::Concurrency {
                    operation_id: error.operation_id.clone(),
                })
            }
        };

        if op.kind == OperationKind::Delete {
            op.item = Some(item);
        } else {
            self.store.upsert(&error.table, &[item], false).await?;
        }
        op.state = OperationState::Pending;
        self.queue.update(&op).await?;
        self.errors.delete(&[error.id.clone()]).await?;
        debug!(table = %error.table, item_id = %error.item_id, "operation updated");
        Ok(())
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("queue", &self.queue)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn check_table(table: &str) -> SyncResult<()> {
    if system_tables::is_system_table(table) {
        return Err(SyncError::invalid_operation(format!(
            "table {table} is reserved for sync bookkeeping"
        )));
    }
    Ok(())
}

fn require_id(item: &Row) -> SyncResult<String> {
    row_id(item)
        .map(str::to_string)
        .ok_or_else(|| SyncError::invalid_operation("item has no id"))
}

fn check_item(error: &OperationError, item: &Row) -> SyncResult<()> {
    if require_id(item)? != error.item_id {
        return Err(SyncError::invalid_operation(format!(
            "item id does not match failed operation on {}",
            error.item_id
        )));
    }
    Ok(())
}
