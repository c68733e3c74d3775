//! Pluggable execution and conflict handling for pushes.

use crate::error::{RemoteError, SyncResult};
use crate::operation::{OperationKind, PendingOperation};
use crate::remote::RemoteTable;
use crate::result::PushCompletionResult;
use async_trait::async_trait;
use mobisync_core::Row;

/// One queued operation, ready to be sent.
#[derive(Debug, Clone)]
pub struct TableOperation {
    operation: PendingOperation,
    /// The item to send. Handlers may edit it before executing, for example
    /// to adopt the server version after a conflict.
    pub item: Row,
    table: RemoteTable,
}

impl TableOperation {
    pub(crate) fn new(operation: PendingOperation, item: Row, table: RemoteTable) -> Self {
        Self {
            operation,
            item,
            table,
        }
    }

    /// The queued operation.
    pub fn operation(&self) -> &PendingOperation {
        &self.operation
    }

    /// Mutation kind.
    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }

    /// The remote table the operation targets.
    pub fn table(&self) -> &RemoteTable {
        &self.table
    }

    /// Sends the current item to the remote table.
    pub async fn execute(&self) -> Result<Option<Row>, RemoteError> {
        self.table.execute(self.operation.kind, &self.item).await
    }
}

/// Hooks invoked by a push.
///
/// Returning `RemoteError::aborted` from `execute_table_operation` stops the
/// whole batch; any other rejection is recorded and the batch continues.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Executes one operation and returns the server copy of the item.
    async fn execute_table_operation(
        &self,
        operation: &mut TableOperation,
    ) -> Result<Option<Row>, RemoteError> {
        operation.execute().await
    }

    /// Called once per push with every recorded failure. Setting `handled`
    /// on an error keeps it from failing the push.
    async fn on_push_complete(&self, _result: &mut PushCompletionResult) -> SyncResult<()> {
        Ok(())
    }
}

/// Executes operations as-is and leaves failures to the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSyncHandler;

impl SyncHandler for DefaultSyncHandler {}
