//! Sync handlers for tests.

use async_trait::async_trait;
use mobisync_core::{columns, row_id, Row};
use mobisync_sync_engine::{
    OperationKind, PushCompletionResult, RemoteError, SyncHandler, SyncResult, TableOperation,
};
use parking_lot::Mutex;
use std::collections::HashSet;

/// An executed operation, as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedOperation {
    /// Target table.
    pub table: String,
    /// Item id.
    pub item_id: String,
    /// Mutation kind.
    pub kind: OperationKind,
    /// The item as sent.
    pub item: Row,
}

/// Records every operation it executes and every completion it sees.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    executed: Mutex<Vec<ExecutedOperation>>,
    completions: Mutex<Vec<PushCompletionResult>>,
    abort_on: Mutex<HashSet<String>>,
    handle_errors: Mutex<bool>,
}

impl RecordingHandler {
    /// A handler that executes everything as-is.
    pub fn new() -> Self {
        Self::default()
    }

    /// Aborts the push when it reaches `item_id`.
    pub fn abort_on(&self, item_id: &str) {
        self.abort_on.lock().insert(item_id.to_string());
    }

    /// Marks every recorded error handled in `on_push_complete`.
    pub fn handle_errors(&self) {
        *self.handle_errors.lock() = true;
    }

    /// Operations executed so far, in order.
    pub fn executed(&self) -> Vec<ExecutedOperation> {
        self.executed.lock().clone()
    }

    /// Item ids executed so far, in order.
    pub fn executed_ids(&self) -> Vec<String> {
        self.executed
            .lock()
            .iter()
            .map(|op| op.item_id.clone())
            .collect()
    }

    /// Results passed to `on_push_complete`.
    pub fn completions(&self) -> Vec<PushCompletionResult> {
        self.completions.lock().clone()
    }
}

#[async_trait]
impl SyncHandler for RecordingHandler {
    async fn execute_table_operation(
        &self,
        operation: &mut TableOperation,
    ) -> Result<Option<Row>, RemoteError> {
        let item_id = operation.operation().item_id.clone();
        if self.abort_on.lock().contains(&item_id) {
            return Err(RemoteError::aborted(format!("handler stopped at {item_id}")));
        }
        self.executed.lock().push(ExecutedOperation {
            table: operation.operation().table.clone(),
            item_id,
            kind: operation.kind(),
            item: operation.item.clone(),
        });
        operation.execute().await
    }

    async fn on_push_complete(&self, result: &mut PushCompletionResult) -> SyncResult<()> {
        if *self.handle_errors.lock() {
            for error in &mut result.errors {
                error.handled = true;
            }
        }
        self.completions.lock().push(result.clone());
        Ok(())
    }
}

/// Resolves version conflicts by overwriting the server copy.
///
/// On a precondition failure the handler adopts the server's version and
/// sends the local item again.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWinsHandler;

#[async_trait]
impl SyncHandler for ClientWinsHandler {
    async fn execute_table_operation(
        &self,
        operation: &mut TableOperation,
    ) -> Result<Option<Row>, RemoteError> {
        match operation.execute().await {
            Err(error) if error.status == Some(412) => {
                let server = error.value.clone().ok_or_else(|| error.clone())?;
                if row_id(&server) != row_id(&operation.item) {
                    return Err(error);
                }
                let version = server
                    .get(columns::VERSION)
                    .cloned()
                    .ok_or_else(|| error.clone())?;
                operation.item.insert(columns::VERSION.into(), version);
                operation.execute().await
            }
            other => other,
        }
    }
}
