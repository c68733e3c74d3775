use super::batch::OperationBatch;
use super::ActionLifecycle;
use crate::error::{PushFailedError, RemoteErrorKind, SyncError, SyncResult};
use crate::handler::{SyncHandler, TableOperation};
use crate::operation::{OperationState, PendingOperation, TableKind};
use crate::operation_error::{OperationError, SyncErrorStore};
use crate::queue::OperationQueue;
use crate::remote::{RemoteService, RemoteTable};
use crate::result::{PushCompletionResult, PushStatus};
use mobisync_core::{row_id, strip_system_columns, LocalStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the drain loop goes after one operation.
enum Step {
    /// Executed and removed from the queue.
    Executed(u64),
    /// Left in the queue; continue after it.
    Passed(u64),
    /// Changed while in flight; look at it again.
    Retry(u64),
    /// The batch was aborted.
    Stop,
}

/// Drains the operation queue against the remote service.
///
/// Operations run one at a time in sequence order, each under its table
/// lock and item lock. Rejections are recorded and the batch moves on;
/// network, authentication, handler and store failures abort the batch and
/// leave the remaining operations queued.
pub struct PushAction {
    lifecycle: ActionLifecycle,
    queue: Arc<OperationQueue>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteService>,
    batch: OperationBatch,
    table_kind: TableKind,
    tables: Vec<String>,
}

impl PushAction {
    /// Creates a push over `tables` (all tables when empty).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OperationQueue>,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteService>,
        handler: Arc<dyn SyncHandler>,
        errors: SyncErrorStore,
        table_kind: TableKind,
        tables: Vec<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            lifecycle: ActionLifecycle::new("push", token),
            queue,
            store,
            remote,
            batch: OperationBatch::new(handler, errors),
            table_kind,
            tables,
        }
    }

    /// Lifecycle of the push.
    pub fn lifecycle(&self) -> &ActionLifecycle {
        &self.lifecycle
    }

    /// Runs the push to completion.
    pub async fn execute(mut self) -> SyncResult<PushCompletionResult> {
        info!(tables = ?self.tables, kind = ?self.table_kind, "push starting");
        let result = self.run().await;
        self.lifecycle.finish(&result);
        result
    }

    async fn run(&mut self) -> SyncResult<PushCompletionResult> {
        let mut last_sequence = 0;
        let mut pushed = 0;

        loop {
            if self.lifecycle.token().is_cancelled() {
                self.batch
                    .abort(PushStatus::CancelledByToken, Some(SyncError::Cancelled));
                break;
            }

            let Some(op) = self
                .queue
                .peek(last_sequence, self.table_kind, &self.tables)
            else {
                break;
            };

            match self.execute_operation(op).await {
                Step::Executed(sequence) => {
                    pushed += 1;
                    last_sequence = sequence;
                }
                Step::Passed(sequence) => last_sequence = sequence,
                Step::Retry(sequence) => last_sequence = sequence.saturating_sub(1),
                Step::Stop => break,
            }

            if self.batch.is_aborted() {
                break;
            }
        }

        self.complete(pushed).await
    }

    async fn execute_operation(&mut self, peeked: PendingOperation) -> Step {
        let token = self.lifecycle.token().clone();

        let _table_lock = match self.queue.lock_table_cancellable(&peeked.table, &token).await {
            Ok(lock) => lock,
            Err(error) => return self.stop(PushStatus::CancelledByToken, error),
        };
        let _item_lock = match self.queue.lock_item_cancellable(&peeked.item_id, &token).await {
            Ok(lock) => lock,
            Err(error) => return self.stop(PushStatus::CancelledByToken, error),
        };

        // The operation may have been coalesced or resolved while we waited.
        let Some(mut op) = self.queue.get(&peeked.id) else {
            return Step::Passed(peeked.sequence);
        };

        let item = match op.item.clone() {
            Some(item) => item,
            None => match self.store.lookup(&op.table, &op.item_id).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    warn!(
                        table = %op.table,
                        item_id = %op.item_id,
                        sequence = op.sequence,
                        "queued item is missing from the local store"
                    );
                    op.state = OperationState::Failed;
                    if let Err(error) = self.queue.update(&op).await {
                        return self.on_queue_error(error, op.sequence);
                    }
                    return self.record(OperationError::item_not_found(&op), op.sequence).await;
                }
                Err(error) => return self.stop(PushStatus::CancelledBySyncStoreError, error.into()),
            },
        };

        if token.is_cancelled() {
            return self.stop(PushStatus::CancelledByToken, SyncError::Cancelled);
        }

        op.state = OperationState::Attempted;
        if let Err(error) = self.queue.update(&op).await {
            return self.on_queue_error(error, op.sequence);
        }

        let table = RemoteTable::new(op.table.clone(), Arc::clone(&self.remote));
        let mut table_op = TableOperation::new(op.clone(), strip_system_columns(&item, true), table);

        debug!(
            table = %op.table,
            item_id = %op.item_id,
            sequence = op.sequence,
            kind = %op.kind,
            "executing operation"
        );

        let handler = Arc::clone(self.batch.handler());
        match handler.execute_table_operation(&mut table_op).await {
            Ok(result) => {
                if op.kind.writes_result_to_store() {
                    if let Some(row) = result.filter(|row| row_id(row).is_some()) {
                        if let Err(error) = self.store.upsert(&op.table, &[row], true).await {
                            return self.stop(PushStatus::CancelledBySyncStoreError, error.into());
                        }
                    }
                }
                match self.queue.delete(&op.id, op.version).await {
                    Ok(_) => Step::Executed(op.sequence),
                    Err(error) => self.on_queue_error(error, op.sequence),
                }
            }
            Err(error) => {
                op.state = OperationState::Failed;
                if let Err(queue_error) = self.queue.update(&op).await {
                    return self.on_queue_error(queue_error, op.sequence);
                }

                debug!(
                    table = %op.table,
                    item_id = %op.item_id,
                    sequence = op.sequence,
                    error = %error,
                    "operation failed"
                );

                match error.kind {
                    RemoteErrorKind::Network => {
                        self.stop(PushStatus::CancelledByNetworkError, error.into())
                    }
                    RemoteErrorKind::Authentication => {
                        self.stop(PushStatus::CancelledByAuthenticationError, error.into())
                    }
                    RemoteErrorKind::Aborted => {
                        self.stop(PushStatus::CancelledByOperation, error.into())
                    }
                    RemoteErrorKind::Rejected => {
                        let record = OperationError::from_remote(&op, table_op.item, &error);
                        self.record(record, op.sequence).await
                    }
                }
            }
        }
    }

    async fn record(&mut self, error: OperationError, sequence: u64) -> Step {
        match self.batch.add_sync_error(&error).await {
            Ok(()) => Step::Passed(sequence),
            Err(store_error) => self.stop(PushStatus::CancelledBySyncStoreError, store_error),
        }
    }

    fn on_queue_error(&mut self, error: SyncError, sequence: u64) -> Step {
        match error {
            SyncError::Concurrency { .. } => Step::Retry(sequence),
            other => self.stop(PushStatus::CancelledBySyncStoreError, other),
        }
    }

    fn stop(&mut self, reason: PushStatus, cause: SyncError) -> Step {
        self.batch.abort(reason, Some(cause));
        Step::Stop
    }

    async fn complete(&mut self, pushed: u64) -> SyncResult<PushCompletionResult> {
        let errors = match self
            .batch
            .load_sync_errors(self.table_kind, &self.tables)
            .await
        {
            Ok(errors) => errors,
            Err(error) => {
                self.batch
                    .abort(PushStatus::CancelledBySyncStoreError, Some(error));
                Vec::new()
            }
        };
        let ids: Vec<String> = errors.iter().map(|e| e.id.clone()).collect();

        let mut result = PushCompletionResult {
            status: self.batch.status(),
            errors,
            pushed,
        };

        let handler = Arc::clone(self.batch.handler());
        if let Err(error) = handler.on_push_complete(&mut result).await {
            warn!(error = %error, "push completion handler failed");
            if result.status == PushStatus::Complete {
                result.status = PushStatus::InternalError;
            }
            self.batch.add_other_error(error);
        }

        if !ids.is_empty() {
            if let Err(error) = self.batch.delete_sync_errors(&ids).await {
                warn!(error = %error, "failed to delete acknowledged sync errors");
                self.batch.add_other_error(error);
            }
        }
        self.batch.release_sync_errors();

        if result.is_success() && self.batch.other_errors().is_empty() {
            info!(pushed, recorded = self.batch.recorded(), "push complete");
            return Ok(result);
        }

        result.errors.retain(|e| !e.handled);
        info!(
            pushed,
            status = ?result.status,
            unhandled = result.errors.len(),
            "push failed"
        );
        Err(PushFailedError {
            result,
            source: self.batch.take_cause().map(Box::new),
        }
        .into())
    }
}

impl std::fmt::Debug for PushAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushAction")
            .field("tables", &self.tables)
            .field("table_kind", &self.table_kind)
            .field("batch", &self.batch)
            .finish_non_exhaustive()
    }
}
