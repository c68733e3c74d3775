//! Test fixtures and sync context helpers.
//!
//! Provides a ready-made local store, mock remote and sync context, plus
//! small builders for rows and timestamps.

use crate::mock_remote::MockRemote;
use chrono::{DateTime, Duration, Utc};
use mobisync_core::{MemoryStore, Row};
use mobisync_sync_engine::{SyncConfig, SyncContext, SyncHandler};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Builds a row from a JSON object literal.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn row(value: Value) -> Row {
    value
        .as_object()
        .cloned()
        .expect("row fixture must be a JSON object")
}

/// A minimal todo item.
pub fn item(id: &str, text: &str) -> Row {
    row(json!({"id": id, "text": text}))
}

/// The mock server time `secs` seconds after its epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    MockRemote::epoch() + Duration::seconds(secs)
}

/// A sync context over a memory store and a mock remote.
pub struct TestSync {
    /// The local store.
    pub store: Arc<MemoryStore>,
    /// The remote service.
    pub remote: Arc<MockRemote>,
    /// The context under test.
    pub context: SyncContext,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestSync {
    /// Creates an in-memory context with the default configuration.
    pub async fn new() -> Self {
        Self::with_config(SyncConfig::default()).await
    }

    /// Creates an in-memory context with a configuration.
    pub async fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let context = SyncContext::builder(store.clone(), remote.clone())
            .with_config(config)
            .initialize()
            .await
            .expect("Failed to initialize sync context");
        Self {
            store,
            remote,
            context,
            _temp_dir: None,
        }
    }

    /// Creates an in-memory context with a sync handler.
    pub async fn with_handler(handler: Arc<dyn SyncHandler>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MockRemote::new());
        let context = SyncContext::builder(store.clone(), remote.clone())
            .with_handler(handler)
            .initialize()
            .await
            .expect("Failed to initialize sync context");
        Self {
            store,
            remote,
            context,
            _temp_dir: None,
        }
    }

    /// Creates a context whose store is snapshotted to a temporary file.
    pub async fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(
            MemoryStore::open(temp_dir.path().join("store.json"))
                .expect("Failed to open store snapshot"),
        );
        let remote = Arc::new(MockRemote::new());
        let context = SyncContext::initialize(store.clone(), remote.clone())
            .await
            .expect("Failed to initialize sync context");
        Self {
            store,
            remote,
            context,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the snapshot path if file-based.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir
            .as_ref()
            .map(|dir| dir.path().join("store.json"))
    }

    /// Simulates an app restart: a fresh context over the same data and
    /// remote. File-based fixtures reload the store from disk.
    pub async fn reopen(self) -> Self {
        let store = match self.path() {
            Some(path) => Arc::new(MemoryStore::open(path).expect("Failed to reopen store snapshot")),
            None => self.store,
        };
        let context = SyncContext::initialize(store.clone(), self.remote.clone())
            .await
            .expect("Failed to reinitialize sync context");
        Self {
            store,
            remote: self.remote,
            context,
            _temp_dir: self._temp_dir,
        }
    }
}

impl std::ops::Deref for TestSync {
    type Target = SyncContext;

    fn deref(&self) -> &Self::Target {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_builders() {
        let todo = item("a", "milk");
        assert_eq!(todo["id"], json!("a"));
        assert_eq!(todo["text"], json!("milk"));
        assert_eq!(ts(60) - ts(0), Duration::minutes(1));
    }

    #[tokio::test]
    async fn file_fixture_survives_reopen() {
        let sync = TestSync::file().await;
        sync.insert("todo", item("a", "milk")).await.unwrap();

        let sync = sync.reopen().await;
        assert_eq!(sync.pending_operations(), 1);
        assert!(sync.lookup("todo", "a").await.unwrap().is_some());
    }
}
