//! A local store that fails on demand.

use async_trait::async_trait;
use mobisync_core::{CoreError, CoreResult, LocalStore, MemoryStore, QueryDescription, Row};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Wraps a [`MemoryStore`] and fails writes to selected tables.
#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failing: Mutex<HashSet<String>>,
    fail_server_writes: Mutex<bool>,
}

impl FlakyStore {
    /// Wraps `inner`. Nothing fails until told to.
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            fail_server_writes: Mutex::new(false),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<MemoryStore> {
        &self.inner
    }

    /// Fails every write to `table`.
    pub fn fail_writes_to(&self, table: &str) {
        self.failing.lock().insert(table.to_string());
    }

    /// Fails only writes flagged `from_server`, in every table.
    pub fn fail_server_writes(&self) {
        *self.fail_server_writes.lock() = true;
    }

    /// Stops failing.
    pub fn heal(&self) {
        self.failing.lock().clear();
        *self.fail_server_writes.lock() = false;
    }

    fn check(&self, table: &str, from_server: bool) -> CoreResult<()> {
        if self.failing.lock().contains(table) || (from_server && *self.fail_server_writes.lock()) {
            return Err(CoreError::store(format!("injected write failure on {table}")));
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for FlakyStore {
    async fn upsert(&self, table: &str, rows: &[Row], from_server: bool) -> CoreResult<()> {
        self.check(table, from_server)?;
        self.inner.upsert(table, rows, from_server).await
    }

    async fn delete(&self, table: &str, ids: &[String]) -> CoreResult<()> {
        self.check(table, false)?;
        self.inner.delete(table, ids).await
    }

    async fn delete_query(&self, query: &QueryDescription) -> CoreResult<u64> {
        self.check(&query.table, false)?;
        self.inner.delete_query(query).await
    }

    async fn lookup(&self, table: &str, id: &str) -> CoreResult<Option<Row>> {
        self.inner.lookup(table, id).await
    }

    async fn read(&self, query: &QueryDescription) -> CoreResult<Vec<Row>> {
        self.inner.read(query).await
    }
}
