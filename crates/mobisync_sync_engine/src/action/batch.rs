use crate::error::{SyncError, SyncResult};
use crate::handler::SyncHandler;
use crate::operation::TableKind;
use crate::operation_error::{OperationError, SyncErrorStore};
use crate::result::PushStatus;
use std::sync::Arc;
use tracing::warn;

/// Working state of one push run.
///
/// Once an abort reason is set it never changes, and no further operations
/// are executed.
pub struct OperationBatch {
    handler: Arc<dyn SyncHandler>,
    errors: SyncErrorStore,
    abort_reason: Option<PushStatus>,
    abort_cause: Option<SyncError>,
    other_errors: Vec<SyncError>,
    /// Ids of the records this batch owns.
    owned: Vec<String>,
    recorded: u64,
}

impl OperationBatch {
    /// Creates a batch recording failures into `errors`.
    pub fn new(handler: Arc<dyn SyncHandler>, errors: SyncErrorStore) -> Self {
        Self {
            handler,
            errors,
            abort_reason: None,
            abort_cause: None,
            other_errors: Vec::new(),
            owned: Vec::new(),
            recorded: 0,
        }
    }

    /// The handler operations are executed through.
    pub fn handler(&self) -> &Arc<dyn SyncHandler> {
        &self.handler
    }

    /// Stops the batch. Only the first reason is kept; later causes are
    /// collected as other errors.
    pub fn abort(&mut self, reason: PushStatus, cause: Option<SyncError>) {
        if self.abort_reason.is_some() {
            if let Some(cause) = cause {
                self.other_errors.push(cause);
            }
            return;
        }
        warn!(reason = ?reason, cause = ?cause.as_ref().map(ToString::to_string), "push batch aborted");
        self.abort_reason = Some(reason);
        self.abort_cause = cause;
    }

    /// Returns true once the batch was aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// The abort reason, or `Complete`.
    pub fn status(&self) -> PushStatus {
        self.abort_reason.unwrap_or(PushStatus::Complete)
    }

    /// Keeps an error that is not tied to a single operation.
    pub fn add_other_error(&mut self, error: SyncError) {
        self.other_errors.push(error);
    }

    /// Errors not tied to a single operation.
    pub fn other_errors(&self) -> &[SyncError] {
        &self.other_errors
    }

    /// Persists a failed operation.
    pub async fn add_sync_error(&mut self, error: &OperationError) -> SyncResult<()> {
        // Claimed before it is visible, so a concurrent push never takes it.
        self.errors.claim(&error.id);
        if let Err(e) = self.errors.record(error).await {
            self.errors.release(std::slice::from_ref(&error.id));
            return Err(e);
        }
        self.owned.push(error.id.clone());
        self.recorded += 1;
        Ok(())
    }

    /// Number of failures recorded by this batch.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    /// Loads the failures this batch recorded, plus unclaimed ones left by
    /// earlier runs on the tables the batch covers.
    pub async fn load_sync_errors(
        &mut self,
        table_kind: TableKind,
        tables: &[String],
    ) -> SyncResult<Vec<OperationError>> {
        let mut errors = self.errors.load().await?;
        errors.retain(|error| {
            if self.owned.contains(&error.id) {
                return true;
            }
            if error.matches(table_kind, tables) && self.errors.claim(&error.id) {
                self.owned.push(error.id.clone());
                return true;
            }
            false
        });
        Ok(errors)
    }

    /// Deletes acknowledged failures.
    pub async fn delete_sync_errors(&self, ids: &[String]) -> SyncResult<()> {
        self.errors.delete(ids).await
    }

    /// Gives up every record this batch owns.
    pub fn release_sync_errors(&mut self) {
        let owned = std::mem::take(&mut self.owned);
        self.errors.release(&owned);
    }

    /// Takes the error that best explains a failed batch.
    pub(crate) fn take_cause(&mut self) -> Option<SyncError> {
        self.abort_cause.take().or_else(|| {
            if self.other_errors.is_empty() {
                None
            } else {
                Some(self.other_errors.remove(0))
            }
        })
    }
}

impl std::fmt::Debug for OperationBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBatch")
            .field("abort_reason", &self.abort_reason)
            .field("other_errors", &self.other_errors.len())
            .field("recorded", &self.recorded)
            .finish_non_exhaustive()
    }
}
