//! Pending operations and the coalescing rules between them.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use mobisync_core::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of local mutation an operation replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create the item on the server.
    Insert,
    /// Replace the server copy.
    Update,
    /// Remove the server copy.
    Delete,
}

impl OperationKind {
    /// Whether a successful result should be written back to the local store.
    ///
    /// Deletes never write back: the local row is already gone.
    pub fn writes_result_to_store(self) -> bool {
        !matches!(self, OperationKind::Delete)
    }

    /// Returns the lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    /// Not yet sent.
    Pending,
    /// Sent; no outcome recorded yet.
    Attempted,
    /// The last attempt failed.
    Failed,
}

/// What kind of table an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// A regular data table.
    #[default]
    Table,
    /// File metadata.
    File,
}

/// A queued local mutation waiting to be pushed.
///
/// Serialized as a row of the `__operations` system table, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Unique operation id.
    pub id: String,
    /// Position in the queue. Never changes once assigned.
    pub sequence: u64,
    /// Bumped whenever the operation is coalesced or edited.
    pub version: u64,
    /// Target table.
    pub table: String,
    /// Target table kind.
    pub table_kind: TableKind,
    /// Target item.
    pub item_id: String,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Payload; `None` means "read the row from the store when executing".
    pub item: Option<Row>,
    /// Execution state.
    pub state: OperationState,
    /// Set when the operation is being removed from the queue.
    pub cancelled: bool,
    /// When the operation was first queued.
    pub created_at: DateTime<Utc>,
}

/// What to do with an existing operation after a new mutation arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalesced {
    /// The operation absorbed the mutation and stays queued.
    Keep,
    /// The mutations cancel out; the operation must be removed.
    Remove,
}

impl PendingOperation {
    /// Creates a new operation at the given queue position.
    pub fn new(
        sequence: u64,
        table: impl Into<String>,
        table_kind: TableKind,
        item_id: impl Into<String>,
        kind: OperationKind,
        item: Option<Row>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sequence,
            version: 1,
            table: table.into(),
            table_kind,
            item_id: item_id.into(),
            kind,
            item,
            state: OperationState::Pending,
            cancelled: false,
            created_at: Utc::now(),
        }
    }

    /// Checks whether a new mutation of `incoming` kind may follow this one.
    pub fn validate(&self, incoming: OperationKind) -> SyncResult<()> {
        use OperationKind::*;

        match (self.kind, incoming) {
            (_, Insert) => Err(SyncError::invalid_operation(format!(
                "an operation on item {} is already queued; insert is not allowed",
                self.item_id
            ))),
            (Delete, Update) => Err(SyncError::invalid_operation(format!(
                "item {} has a pending delete; update is not allowed",
                self.item_id
            ))),
            (Delete, Delete) => Err(SyncError::invalid_operation(format!(
                "item {} has a pending delete",
                self.item_id
            ))),
            _ => Ok(()),
        }
    }

    /// Folds a validated mutation into this operation.
    ///
    /// The sequence is kept so queue order reflects the first touch of the item.
    pub fn coalesce(&mut self, incoming: OperationKind, item: Option<Row>) -> Coalesced {
        use OperationKind::*;

        let kind = match (self.kind, incoming) {
            (Insert, Delete) => return Coalesced::Remove,
            (Insert, _) => Insert,
            (_, Delete) => Delete,
            _ => Update,
        };

        self.kind = kind;
        self.item = item;
        self.state = OperationState::Pending;
        self.version += 1;
        Coalesced::Keep
    }

    /// Serializes the operation as a store row.
    pub fn to_row(&self) -> SyncResult<Row> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(row) => Ok(row),
            _ => Err(SyncError::invalid_operation("operation did not serialize to an object")),
        }
    }

    /// Decodes an operation from a store row.
    pub fn from_row(row: &Row) -> SyncResult<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(row.clone()))?)
    }
}
