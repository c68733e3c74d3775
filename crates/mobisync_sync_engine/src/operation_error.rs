//! Recorded push failures.

use crate::error::{RemoteError, SyncResult};
use crate::operation::{OperationKind, PendingOperation, TableKind};
use chrono::{DateTime, Utc};
use mobisync_core::{system_tables, LocalStore, QueryDescription, Row};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// A pending operation the remote rejected.
///
/// Recorded during a push batch without stopping it, then handed to the
/// sync handler and finally to the caller. The resolution helpers on
/// `SyncContext` take one of these to settle the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// Record id.
    pub id: String,
    /// The failed operation.
    pub operation_id: String,
    /// Operation version at the time of failure.
    pub operation_version: u64,
    /// Operation kind.
    pub operation_kind: OperationKind,
    /// Target table.
    pub table: String,
    /// Target table kind.
    pub table_kind: TableKind,
    /// Target item.
    pub item_id: String,
    /// The item as it was sent.
    pub item: Row,
    /// HTTP status, if the failure came from a response.
    pub status: Option<u16>,
    /// Raw response body.
    pub raw_result: Option<String>,
    /// Parsed response body, usually the server copy on conflicts.
    pub result: Option<Row>,
    /// Failure message.
    pub message: String,
    /// Set by a sync handler that resolved the failure.
    pub handled: bool,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl OperationError {
    /// Records a remote rejection.
    pub fn from_remote(op: &PendingOperation, item: Row, error: &RemoteError) -> Self {
        Self {
            status: error.status,
            raw_result: error.raw_response.clone(),
            result: error.value.clone(),
            ..Self::new(op, item, error.message.clone())
        }
    }

    /// Records an operation whose item vanished from the local store.
    pub fn item_not_found(op: &PendingOperation) -> Self {
        let mut item = Row::new();
        item.insert("id".into(), op.item_id.clone().into());
        Self::new(op, item, "item not found in local store".into())
    }

    fn new(op: &PendingOperation, item: Row, message: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            operation_id: op.id.clone(),
            operation_version: op.version,
            operation_kind: op.kind,
            table: op.table.clone(),
            table_kind: op.table_kind,
            item_id: op.item_id.clone(),
            item,
            status: None,
            raw_result: None,
            result: None,
            message,
            handled: false,
            recorded_at: Utc::now(),
        }
    }

    /// Returns true for 409 and 412 failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self.status, Some(409) | Some(412))
    }

    /// Returns true if a push over `tables` of `table_kind` covers this
    /// record. An empty table list covers every table.
    pub fn matches(&self, table_kind: TableKind, tables: &[String]) -> bool {
        self.table_kind == table_kind && (tables.is_empty() || tables.contains(&self.table))
    }

    fn to_row(&self) -> SyncResult<Row> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(row) => Ok(row),
            _ => Ok(Row::new()),
        }
    }
}

/// The `__errors` system table.
///
/// Clones share the set of records claimed by running pushes, so a record
/// is reported to exactly one push.
#[derive(Clone)]
pub struct SyncErrorStore {
    store: Arc<dyn LocalStore>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl SyncErrorStore {
    /// Wraps a local store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Marks a record as owned by a running push. Returns false if another
    /// push already owns it.
    pub fn claim(&self, id: &str) -> bool {
        self.claimed.lock().insert(id.to_string())
    }

    /// Gives up ownership of records.
    pub fn release(&self, ids: &[String]) {
        let mut claimed = self.claimed.lock();
        for id in ids {
            claimed.remove(id);
        }
    }

    /// Persists a record.
    pub async fn record(&self, error: &OperationError) -> SyncResult<()> {
        self.store
            .upsert(system_tables::ERRORS, &[error.to_row()?], false)
            .await?;
        Ok(())
    }

    /// Loads every record, oldest first.
    pub async fn load(&self) -> SyncResult<Vec<OperationError>> {
        let rows = self
            .store
            .read(&QueryDescription::new(system_tables::ERRORS).including_deleted())
            .await?;
        let mut errors = rows
            .into_iter()
            .map(|row| serde_json::from_value(serde_json::Value::Object(row)))
            .collect::<Result<Vec<OperationError>, _>>()?;
        errors.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id)));
        Ok(errors)
    }

    /// Deletes records by id.
    pub async fn delete(&self, ids: &[String]) -> SyncResult<()> {
        self.store.delete(system_tables::ERRORS, ids).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncErrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncErrorStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobisync_core::MemoryStore;
    use serde_json::json;

    fn operation() -> PendingOperation {
        PendingOperation::new(4, "todo", TableKind::Table, "a", OperationKind::Update, None)
    }

    #[test]
    fn conflict_record_keeps_server_copy() {
        let server = json!({"id": "a", "version": "9"}).as_object().cloned().unwrap();
        let local = json!({"id": "a", "version": "8"}).as_object().cloned().unwrap();
        let op = operation();

        let error = OperationError::from_remote(&op, local.clone(), &RemoteError::precondition_failed(server.clone()));
        assert!(error.is_conflict());
        assert_eq!(error.operation_id, op.id);
        assert_eq!(error.item, local);
        assert_eq!(error.result, Some(server));
        assert!(!error.handled);
    }

    #[test]
    fn missing_item_record() {
        let error = OperationError::item_not_found(&operation());
        assert_eq!(error.item["id"], json!("a"));
        assert_eq!(error.status, None);
        assert!(!error.is_conflict());
    }

    #[tokio::test]
    async fn store_roundtrip() {
        let store = SyncErrorStore::new(Arc::new(MemoryStore::new()));
        let first = OperationError::item_not_found(&operation());
        let second = OperationError::from_remote(
            &operation(),
            Row::new(),
            &RemoteError::rejected(400, "bad request"),
        );
        store.record(&first).await.unwrap();
        store.record(&second).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&first));

        store.delete(&[first.id.clone()]).await.unwrap();
        assert_eq!(store.load().await.unwrap(), vec![second]);
    }

    #[test]
    fn claims_are_shared_between_clones() {
        let store = SyncErrorStore::new(Arc::new(MemoryStore::new()));
        let other = store.clone();

        assert!(store.claim("e1"));
        assert!(!other.claim("e1"));
        other.release(&["e1".to_string()]);
        assert!(store.claim("e1"));
    }

    #[test]
    fn records_match_their_push_filter() {
        let error = OperationError::item_not_found(&operation());
        assert!(error.matches(TableKind::Table, &[]));
        assert!(error.matches(TableKind::Table, &["todo".to_string()]));
        assert!(!error.matches(TableKind::Table, &["notes".to_string()]));
        assert!(!error.matches(TableKind::File, &[]));
    }
}
