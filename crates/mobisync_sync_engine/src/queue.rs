//! The durable queue of pending local mutations.

use crate::error::{SyncError, SyncResult};
use crate::lock::{LockRegistry, ScopedLock};
use crate::operation::{Coalesced, OperationKind, PendingOperation, TableKind};
use mobisync_core::{system_tables, LocalStore, QueryDescription, Row};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueIndex {
    by_sequence: BTreeMap<u64, PendingOperation>,
    by_item: HashMap<(String, String), u64>,
    by_id: HashMap<String, u64>,
    next_sequence: u64,
}

impl QueueIndex {
    fn insert(&mut self, op: PendingOperation) {
        self.by_item
            .insert((op.table.clone(), op.item_id.clone()), op.sequence);
        self.by_id.insert(op.id.clone(), op.sequence);
        self.next_sequence = self.next_sequence.max(op.sequence + 1);
        self.by_sequence.insert(op.sequence, op);
    }

    fn remove(&mut self, sequence: u64) -> Option<PendingOperation> {
        let op = self.by_sequence.remove(&sequence)?;
        self.by_item.remove(&(op.table.clone(), op.item_id.clone()));
        self.by_id.remove(&op.id);
        Some(op)
    }

    fn get(&self, id: &str) -> Option<&PendingOperation> {
        self.by_id.get(id).and_then(|seq| self.by_sequence.get(seq))
    }

    fn get_by_item(&self, table: &str, item_id: &str) -> Option<&PendingOperation> {
        self.by_item
            .get(&(table.to_string(), item_id.to_string()))
            .and_then(|seq| self.by_sequence.get(seq))
    }
}

/// Ordered ledger of pending operations, persisted in the `__operations`
/// system table.
///
/// Every mutation is written to the store before the in-memory index
/// changes, so a failed write leaves the queue exactly as it was. The queue
/// also owns the per-item and per-table lock registries used to serialize
/// local writes and push execution.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    index: RwLock<QueueIndex>,
    mutation: AsyncMutex<()>,
    item_locks: Arc<LockRegistry>,
    table_locks: Arc<LockRegistry>,
}

impl OperationQueue {
    /// Rebuilds the queue from the store.
    ///
    /// Operations left marked as cancelled by an interrupted removal are
    /// deleted now.
    pub async fn load(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let rows = store
            .read(&QueryDescription::new(system_tables::OPERATIONS).including_deleted())
            .await?;

        let mut index = QueueIndex {
            next_sequence: 1,
            ..QueueIndex::default()
        };
        let mut stale = Vec::new();

        let mut ops = rows
            .iter()
            .map(PendingOperation::from_row)
            .collect::<SyncResult<Vec<_>>>()?;
        ops.sort_by_key(|op| op.sequence);

        for op in ops {
            if op.cancelled {
                stale.push(op.id);
                continue;
            }
            if let Some(existing) = index.get_by_item(&op.table, &op.item_id) {
                warn!(
                    table = %op.table,
                    item_id = %op.item_id,
                    kept = existing.sequence,
                    dropped = op.sequence,
                    "duplicate pending operation for item"
                );
                stale.push(op.id);
                continue;
            }
            index.insert(op);
        }

        if !stale.is_empty() {
            store.delete(system_tables::OPERATIONS, &stale).await?;
        }

        debug!(
            operations = index.by_sequence.len(),
            next_sequence = index.next_sequence,
            "loaded operation queue"
        );

        Ok(Self {
            store,
            index: RwLock::new(index),
            mutation: AsyncMutex::new(()),
            item_locks: LockRegistry::new(),
            table_locks: LockRegistry::new(),
        })
    }

    /// Fails if a mutation of `kind` may not follow the item's queued operation.
    pub fn validate(&self, table: &str, item_id: &str, kind: OperationKind) -> SyncResult<()> {
        match self.index.read().get_by_item(table, item_id) {
            Some(existing) => existing.validate(kind),
            None => Ok(()),
        }
    }

    /// Records a local mutation, coalescing with any queued operation for the
    /// same item.
    ///
    /// Returns the queued operation, or `None` when the mutation cancelled the
    /// queued one out.
    pub async fn enqueue(
        &self,
        table: &str,
        table_kind: TableKind,
        item_id: &str,
        kind: OperationKind,
        item: Option<Row>,
    ) -> SyncResult<Option<PendingOperation>> {
        let _mutation = self.mutation.lock().await;

        let (existing, next_sequence) = {
            let index = self.index.read();
            (index.get_by_item(table, item_id).cloned(), index.next_sequence)
        };

        let Some(mut op) = existing else {
            let op = PendingOperation::new(next_sequence, table, table_kind, item_id, kind, item);
            self.persist(&op).await?;
            debug!(table, item_id, sequence = op.sequence, kind = %kind, "queued operation");
            self.index.write().insert(op.clone());
            return Ok(Some(op));
        };

        op.validate(kind)?;
        match op.coalesce(kind, item) {
            Coalesced::Keep => {
                self.persist(&op).await?;
                debug!(
                    table,
                    item_id,
                    sequence = op.sequence,
                    kind = %op.kind,
                    version = op.version,
                    "coalesced operation"
                );
                self.index.write().insert(op.clone());
                Ok(Some(op))
            }
            Coalesced::Remove => {
                op.cancelled = true;
                self.persist(&op).await?;
                self.store
                    .delete(system_tables::OPERATIONS, &[op.id.clone()])
                    .await?;
                debug!(table, item_id, sequence = op.sequence, "operation cancelled out");
                self.index.write().remove(op.sequence);
                Ok(None)
            }
        }
    }

    /// Returns the first live operation after `after_sequence` matching the
    /// filter. An empty `tables` slice matches every table.
    pub fn peek(
        &self,
        after_sequence: u64,
        table_kind: TableKind,
        tables: &[String],
    ) -> Option<PendingOperation> {
        self.index
            .read()
            .by_sequence
            .range((Bound::Excluded(after_sequence), Bound::Unbounded))
            .map(|(_, op)| op)
            .find(|op| {
                !op.cancelled
                    && op.table_kind == table_kind
                    && (tables.is_empty() || tables.iter().any(|t| *t == op.table))
            })
            .cloned()
    }

    /// Persists a state transition of a queued operation.
    ///
    /// Fails with `Concurrency` if the operation was removed or coalesced
    /// since it was read.
    pub async fn update(&self, op: &PendingOperation) -> SyncResult<()> {
        let _mutation = self.mutation.lock().await;
        self.check_version(&op.id, op.version)?;
        self.persist(op).await?;
        self.index.write().insert(op.clone());
        Ok(())
    }

    /// Removes an operation after it was executed or resolved.
    ///
    /// Returns false if it was already gone. Fails with `Concurrency` if the
    /// stored version differs, meaning the item changed while the operation
    /// was in flight.
    pub async fn delete(&self, id: &str, version: u64) -> SyncResult<bool> {
        let _mutation = self.mutation.lock().await;
        let sequence = {
            let index = self.index.read();
            match index.get(id) {
                None => return Ok(false),
                Some(op) if op.version != version => {
                    return Err(SyncError::Concurrency {
                        operation_id: id.to_string(),
                    })
                }
                Some(op) => op.sequence,
            }
        };
        self.store
            .delete(system_tables::OPERATIONS, &[id.to_string()])
            .await?;
        self.index.write().remove(sequence);
        Ok(true)
    }

    /// Drops every queued operation of a table and returns how many there were.
    pub async fn delete_table(&self, table: &str) -> SyncResult<u64> {
        let _mutation = self.mutation.lock().await;
        let victims: Vec<(u64, String)> = self
            .index
            .read()
            .by_sequence
            .values()
            .filter(|op| op.table == table)
            .map(|op| (op.sequence, op.id.clone()))
            .collect();
        if victims.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = victims.iter().map(|(_, id)| id.clone()).collect();
        self.store.delete(system_tables::OPERATIONS, &ids).await?;

        let mut index = self.index.write();
        for (sequence, _) in &victims {
            index.remove(*sequence);
        }
        warn!(table, discarded = victims.len(), "discarded pending operations");
        Ok(victims.len() as u64)
    }

    /// Returns the operation with the given id.
    pub fn get(&self, id: &str) -> Option<PendingOperation> {
        self.index.read().get(id).cloned()
    }

    /// Returns the queued operation for an item.
    pub fn get_by_item(&self, table: &str, item_id: &str) -> Option<PendingOperation> {
        self.index.read().get_by_item(table, item_id).cloned()
    }

    /// Number of queued operations for a table.
    pub fn count_pending(&self, table: &str) -> u64 {
        self.index
            .read()
            .by_sequence
            .values()
            .filter(|op| !op.cancelled && op.table == table)
            .count() as u64
    }

    /// Number of queued operations across all tables.
    pub fn pending_count(&self) -> u64 {
        self.index
            .read()
            .by_sequence
            .values()
            .filter(|op| !op.cancelled)
            .count() as u64
    }

    /// Snapshot of the queue in sequence order.
    pub fn operations(&self) -> Vec<PendingOperation> {
        self.index.read().by_sequence.values().cloned().collect()
    }

    /// Locks an item against concurrent local writes and push execution.
    pub async fn lock_item(&self, item_id: &str) -> ScopedLock {
        self.item_locks.acquire(item_id).await
    }

    /// Like [`lock_item`](Self::lock_item), giving up when the token fires.
    pub async fn lock_item_cancellable(
        &self,
        item_id: &str,
        token: &CancellationToken,
    ) -> SyncResult<ScopedLock> {
        self.item_locks.acquire_cancellable(item_id, token).await
    }

    /// Locks a table against concurrent push, pull and purge work.
    ///
    /// Pull and purge hold the lock for their whole run. A push holds it
    /// for one operation at a time, so a purge or pull of the same table can
    /// run between two operations of a long push.
    pub async fn lock_table(&self, table: &str) -> ScopedLock {
        self.table_locks.acquire(table).await
    }

    /// Like [`lock_table`](Self::lock_table), giving up when the token fires.
    pub async fn lock_table_cancellable(
        &self,
        table: &str,
        token: &CancellationToken,
    ) -> SyncResult<ScopedLock> {
        self.table_locks.acquire_cancellable(table, token).await
    }

    fn check_version(&self, id: &str, version: u64) -> SyncResult<()> {
        match self.index.read().get(id) {
            Some(op) if op.version == version => Ok(()),
            _ => Err(SyncError::Concurrency {
                operation_id: id.to_string(),
            }),
        }
    }

    async fn persist(&self, op: &PendingOperation) -> SyncResult<()> {
        let row = op.to_row()?;
        self.store
            .upsert(system_tables::OPERATIONS, &[row], false)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationState;
    use mobisync_core::MemoryStore;
    use serde_json::json;

    async fn queue() -> (Arc<MemoryStore>, OperationQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = OperationQueue::load(store.clone()).await.unwrap();
        (store, queue)
    }

    async fn enqueue(queue: &OperationQueue, table: &str, item: &str, kind: OperationKind) {
        queue
            .enqueue(table, TableKind::Table, item, kind, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sequences_follow_first_touch() {
        let (store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        enqueue(&queue, "todo", "b", OperationKind::Update).await;
        enqueue(&queue, "todo", "a", OperationKind::Update).await;

        let ops = queue.operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].item_id, "a");
        assert_eq!(ops[0].kind, OperationKind::Insert);
        assert_eq!(ops[0].version, 2);
        assert_eq!(ops[1].item_id, "b");
        assert_eq!(store.row_count(system_tables::OPERATIONS), 2);
    }

    #[tokio::test]
    async fn insert_then_delete_leaves_nothing() {
        let (store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        let result = queue
            .enqueue("todo", TableKind::Table, "a", OperationKind::Delete, None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(store.row_count(system_tables::OPERATIONS), 0);
    }

    #[tokio::test]
    async fn rejected_mutation_changes_nothing() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Update).await;
        let before = queue.operations();

        let err = queue
            .enqueue("todo", TableKind::Table, "a", OperationKind::Insert, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperation(_)));
        assert_eq!(queue.operations(), before);
    }

    #[tokio::test]
    async fn peek_filters_by_table_and_kind() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        enqueue(&queue, "notes", "b", OperationKind::Insert).await;
        queue
            .enqueue("files", TableKind::File, "c", OperationKind::Insert, None)
            .await
            .unwrap();

        let first = queue.peek(0, TableKind::Table, &[]).unwrap();
        assert_eq!(first.item_id, "a");

        let notes = queue.peek(0, TableKind::Table, &["notes".to_string()]).unwrap();
        assert_eq!(notes.item_id, "b");

        assert!(queue.peek(notes.sequence, TableKind::Table, &[]).is_none());
        assert_eq!(queue.peek(0, TableKind::File, &[]).unwrap().item_id, "c");
    }

    #[tokio::test]
    async fn delete_checks_version() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Update).await;
        let op = queue.peek(0, TableKind::Table, &[]).unwrap();

        enqueue(&queue, "todo", "a", OperationKind::Update).await;
        let err = queue.delete(&op.id, op.version).await.unwrap_err();
        assert!(matches!(err, SyncError::Concurrency { .. }));

        assert!(queue.delete(&op.id, op.version + 1).await.unwrap());
        assert!(!queue.delete(&op.id, op.version + 1).await.unwrap());
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn update_persists_state() {
        let (store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        let mut op = queue.peek(0, TableKind::Table, &[]).unwrap();
        op.state = OperationState::Attempted;
        queue.update(&op).await.unwrap();

        let reloaded = OperationQueue::load(store).await.unwrap();
        assert_eq!(
            reloaded.get(&op.id).unwrap().state,
            OperationState::Attempted
        );
    }

    #[tokio::test]
    async fn reload_continues_sequence() {
        let (store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        enqueue(&queue, "todo", "b", OperationKind::Insert).await;
        drop(queue);

        let queue = OperationQueue::load(store).await.unwrap();
        let op = queue
            .enqueue("todo", TableKind::Table, "c", OperationKind::Insert, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.sequence, 3);
    }

    #[tokio::test]
    async fn load_drops_cancelled_operations() {
        let store = Arc::new(MemoryStore::new());
        let mut op = PendingOperation::new(1, "todo", TableKind::Table, "a", OperationKind::Insert, None);
        op.cancelled = true;
        store
            .upsert(system_tables::OPERATIONS, &[op.to_row().unwrap()], false)
            .await
            .unwrap();

        let queue = OperationQueue::load(store.clone()).await.unwrap();
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(store.row_count(system_tables::OPERATIONS), 0);
    }

    #[tokio::test]
    async fn delete_table_only_touches_that_table() {
        let (_store, queue) = queue().await;
        enqueue(&queue, "todo", "a", OperationKind::Insert).await;
        enqueue(&queue, "todo", "b", OperationKind::Update).await;
        enqueue(&queue, "notes", "c", OperationKind::Update).await;

        assert_eq!(queue.delete_table("todo").await.unwrap(), 2);
        assert_eq!(queue.count_pending("todo"), 0);
        assert_eq!(queue.count_pending("notes"), 1);
    }

    #[tokio::test]
    async fn delete_payload_is_kept() {
        let (_store, queue) = queue().await;
        let row = json!({"id": "a", "version": "2"}).as_object().cloned().unwrap();
        let op = queue
            .enqueue("todo", TableKind::Table, "a", OperationKind::Delete, Some(row.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.item, Some(row));
        assert!(queue.validate("todo", "a", OperationKind::Update).is_err());
    }
}
