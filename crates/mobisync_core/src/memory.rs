//! In-memory local store with optional file snapshots.

use crate::error::{CoreError, CoreResult};
use crate::query::QueryDescription;
use crate::row::{row_id, Row};
use crate::store::LocalStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

/// A `LocalStore` that keeps every table in memory.
///
/// When opened with a path, the full contents are written to that file as
/// JSON after every successful mutation (write to a temporary file, then
/// rename), so the store survives a restart.
///
/// # Example
///
/// ```
/// use mobisync_core::{LocalStore, MemoryStore};
/// use serde_json::json;
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let store = MemoryStore::new();
///     let row = json!({"id": "a", "text": "milk"}).as_object().cloned().unwrap();
///     store.upsert("todo", &[row], false).await.unwrap();
///     assert!(store.lookup("todo", "a").await.unwrap().is_some());
/// });
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
    server_writes: AtomicU64,
    local_writes: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty, purely in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a store backed by a snapshot file, loading it if it exists.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                Tables::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Tables::new()
        };

        debug!(path = %path.display(), tables = tables.len(), "opened store snapshot");

        Ok(Self {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
            server_writes: AtomicU64::new(0),
            local_writes: AtomicU64::new(0),
        })
    }

    /// Returns the snapshot path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Returns all rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Returns the names of all non-empty tables.
    pub fn table_names(&self) -> Vec<String> {
        self.tables
            .read()
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of rows written with `from_server = true`.
    pub fn server_writes(&self) -> u64 {
        self.server_writes.load(Ordering::SeqCst)
    }

    /// Number of rows written with `from_server = false`.
    pub fn local_writes(&self) -> u64 {
        self.local_writes.load(Ordering::SeqCst)
    }

    /// Writes the current contents to the snapshot file, if one is configured.
    pub fn flush(&self) -> CoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = {
            let tables = self.tables.read();
            serde_json::to_vec_pretty(&*tables)?
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> CoreResult<R>) -> CoreResult<R> {
        let result = {
            let mut tables = self.tables.write();
            // Apply to a copy so a failing closure leaves the store untouched.
            let mut staged = tables.clone();
            let result = f(&mut staged)?;
            *tables = staged;
            result
        };
        self.flush()?;
        Ok(result)
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn upsert(&self, table: &str, rows: &[Row], from_server: bool) -> CoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        self.mutate(|tables| {
            let target = tables.entry(table.to_string()).or_default();
            for row in rows {
                let id = row_id(row)
                    .ok_or_else(|| CoreError::invalid_row(table, "row has no string id"))?;
                let existing = target.entry(id.to_string()).or_default();
                for (column, value) in row {
                    existing.insert(column.clone(), value.clone());
                }
            }
            Ok(())
        })?;

        let counter = if from_server {
            &self.server_writes
        } else {
            &self.local_writes
        };
        counter.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, table: &str, ids: &[String]) -> CoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mutate(|tables| {
            if let Some(rows) = tables.get_mut(table) {
                for id in ids {
                    rows.remove(id);
                }
            }
            Ok(())
        })
    }

    async fn delete_query(&self, query: &QueryDescription) -> CoreResult<u64> {
        self.mutate(|tables| {
            let Some(rows) = tables.get_mut(&query.table) else {
                return Ok(0);
            };
            // Paging applies to the selection of victims, not to the table.
            let victims: Vec<String> = query
                .apply(rows.values())
                .iter()
                .filter_map(|row| row_id(row).map(str::to_string))
                .collect();
            for id in &victims {
                rows.remove(id);
            }
            Ok(victims.len() as u64)
        })
    }

    async fn lookup(&self, table: &str, id: &str) -> CoreResult<Option<Row>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn read(&self, query: &QueryDescription) -> CoreResult<Vec<Row>> {
        let tables = self.tables.read();
        Ok(tables
            .get(&query.table)
            .map(|rows| query.apply(rows.values()))
            .unwrap_or_default())
    }
}
