//! Error types for the sync engine.

use crate::result::{PushCompletionResult, PushStatus};
use mobisync_core::{CoreError, Row};
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error. Always fatal to the current batch or action.
    #[error("store error: {0}")]
    Core(#[from] CoreError),

    /// The request conflicts with the queued state (for example an insert on
    /// an item that already has a pending operation).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A queued operation changed between read and write; re-read and retry.
    #[error("operation {operation_id} was modified concurrently")]
    Concurrency {
        /// Operation ID.
        operation_id: String,
    },

    /// The action was cancelled through its token.
    #[error("sync cancelled")]
    Cancelled,

    /// The table still has pending operations.
    #[error("table {table} has pending operations")]
    TableDirty {
        /// Table name.
        table: String,
    },

    /// The remote service failed a request outside of a push batch.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A push completed with unhandled errors or was aborted.
    #[error(transparent)]
    PushFailed(Box<PushFailedError>),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Persisted sync state could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.kind == RemoteErrorKind::Network,
            SyncError::PushFailed(e) => e.result.status == PushStatus::CancelledByNetworkError,
            _ => false,
        }
    }

    /// Returns true if this error reports a cancellation.
    pub fn is_cancellation(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::PushFailed(e) => e.result.status == PushStatus::CancelledByToken,
            _ => false,
        }
    }

    /// Returns the push result carried by a failed push.
    pub fn push_result(&self) -> Option<&PushCompletionResult> {
        match self {
            SyncError::PushFailed(e) => Some(&e.result),
            _ => None,
        }
    }
}

impl From<PushFailedError> for SyncError {
    fn from(error: PushFailedError) -> Self {
        SyncError::PushFailed(Box::new(error))
    }
}

/// A push that did not complete cleanly.
///
/// `result.errors` holds only the errors no handler marked as handled.
#[derive(Error, Debug)]
#[error("push failed with status {status:?}: {count} unhandled error(s)", status = self.result.status, count = self.result.errors.len())]
pub struct PushFailedError {
    /// Final batch status and unhandled errors.
    pub result: PushCompletionResult,
    /// Error that aborted the batch, if any.
    #[source]
    pub source: Option<Box<SyncError>>,
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The service could not be reached.
    Network,
    /// The credentials were rejected.
    Authentication,
    /// A sync handler asked to stop the batch.
    Aborted,
    /// The service rejected the request (conflict, validation, not found...).
    Rejected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteErrorKind::Network => "network error",
            RemoteErrorKind::Authentication => "authentication error",
            RemoteErrorKind::Aborted => "aborted by handler",
            RemoteErrorKind::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A failure reported by the remote service or a sync handler.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    /// Classification.
    pub kind: RemoteErrorKind,
    /// Human-readable message.
    pub message: String,
    /// HTTP status code, if the failure came from a response.
    pub status: Option<u16>,
    /// Raw response body.
    pub raw_response: Option<String>,
    /// Response body parsed as a row (the server copy on conflicts).
    pub value: Option<Row>,
}

impl RemoteError {
    fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            raw_response: None,
            value: None,
        }
    }

    /// The service could not be reached.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    /// The request was not authorized.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self {
            status: Some(401),
            ..Self::new(RemoteErrorKind::Authentication, message)
        }
    }

    /// A handler-requested stop of the push batch.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Aborted, message)
    }

    /// The service rejected the request with the given status.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(RemoteErrorKind::Rejected, message)
        }
    }

    /// 409: the item already exists on the server.
    pub fn conflict(server_item: Row) -> Self {
        Self::rejected(409, "conflict").with_value(server_item)
    }

    /// 412: the item's version does not match the server copy.
    pub fn precondition_failed(server_item: Row) -> Self {
        Self::rejected(412, "precondition failed").with_value(server_item)
    }

    /// Attaches the parsed response body; also fills the raw body.
    #[must_use]
    pub fn with_value(mut self, value: Row) -> Self {
        if self.raw_response.is_none() {
            self.raw_response = serde_json::to_string(&value).ok();
        }
        self.value = Some(value);
        self
    }

    /// Attaches the raw response body.
    #[must_use]
    pub fn with_raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// Returns true for 409 and 412 responses.
    pub fn is_conflict(&self) -> bool {
        matches!(self.status, Some(409) | Some(412))
    }
}
