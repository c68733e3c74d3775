//! Error types for MobiSync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the local store and row model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error while reading or writing a store snapshot.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A row is missing required data or has the wrong shape.
    #[error("invalid row in table {table}: {message}")]
    InvalidRow {
        /// Table the row belongs to.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// The store rejected or failed a write.
    #[error("store error: {message}")]
    Store {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid row error.
    pub fn invalid_row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a generic store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::invalid_row("todo", "missing id");
        assert_eq!(err.to_string(), "invalid row in table todo: missing id");

        let err = CoreError::store("disk full");
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn io_conversion() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
