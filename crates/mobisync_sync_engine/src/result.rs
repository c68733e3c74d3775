//! Push outcomes.

use crate::operation_error::OperationError;
use serde::{Deserialize, Serialize};

/// How a push batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushStatus {
    /// Every operation was attempted.
    Complete,
    /// The cancellation token fired.
    CancelledByToken,
    /// The remote could not be reached.
    CancelledByNetworkError,
    /// The remote rejected the credentials.
    CancelledByAuthenticationError,
    /// A sync handler aborted the batch.
    CancelledByOperation,
    /// The local store failed.
    CancelledBySyncStoreError,
    /// Something else went wrong, such as a failing completion handler.
    InternalError,
}

impl PushStatus {
    /// Returns true if the batch stopped before draining the queue.
    pub fn is_aborted(self) -> bool {
        !matches!(self, PushStatus::Complete | PushStatus::InternalError)
    }
}

/// Summary of one push batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PushCompletionResult {
    /// Final status.
    pub status: PushStatus,
    /// Recorded operation failures.
    pub errors: Vec<OperationError>,
    /// Operations that executed and left the queue.
    pub pushed: u64,
}

impl PushCompletionResult {
    /// An empty result with the given status.
    pub fn new(status: PushStatus) -> Self {
        Self {
            status,
            errors: Vec::new(),
            pushed: 0,
        }
    }

    /// Errors no handler marked as handled.
    pub fn unhandled_errors(&self) -> impl Iterator<Item = &OperationError> {
        self.errors.iter().filter(|e| !e.handled)
    }

    /// Returns true if the batch completed with nothing left unresolved.
    pub fn is_success(&self) -> bool {
        self.status == PushStatus::Complete && self.unhandled_errors().next().is_none()
    }
}
