//! Keyed async locks.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// A map of named async mutexes.
///
/// Entries are created on first use and dropped again once nobody holds or
/// waits for them, so the map only ever contains contended keys.
#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Waits for the lock on `key`.
    pub(crate) async fn acquire(self: &Arc<Self>, key: &str) -> ScopedLock {
        let guard = self.entry(key).lock_owned().await;
        ScopedLock {
            registry: Arc::clone(self),
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Waits for the lock on `key` unless the token fires first.
    pub(crate) async fn acquire_cancellable(
        self: &Arc<Self>,
        key: &str,
        token: &CancellationToken,
    ) -> SyncResult<ScopedLock> {
        let entry = self.entry(key);
        let guard = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            guard = entry.lock_owned() => Some(guard),
        };
        match guard {
            Some(guard) => Ok(ScopedLock {
                registry: Arc::clone(self),
                key: key.to_string(),
                guard: Some(guard),
            }),
            None => {
                self.release(key);
                Err(SyncError::Cancelled)
            }
        }
    }

    fn release(&self, key: &str) {
        let mut locks = self.locks.lock();
        if let Some(entry) = locks.get(key) {
            // Only the map itself still references the mutex.
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Exclusive access to one key of a lock registry, released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedLock {
    registry: Arc<LockRegistry>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ScopedLock {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        self.guard.take();
        self.registry.release(&self.key);
    }
}
