//! # MobiSync Sync Engine
//!
//! Offline operation queue and sync actions for MobiSync.
//!
//! This crate provides:
//! - A durable, coalescing queue of pending local mutations
//! - Push: drains the queue against a remote table service
//! - Pull: incremental, delta-token based fetch of remote changes
//! - Purge: removal of local rows for a query
//! - A pluggable sync handler for conflict resolution
//! - `SyncContext`, the API applications write and sync through
//!
//! ## Architecture
//!
//! Every local write goes to the store and into the [`OperationQueue`]
//! under a per-item lock. A push replays the queue in order; a pull refuses
//! to overwrite queued changes and pushes a dirty table before fetching it.
//!
//! ## Key Invariants
//!
//! - At most one queued operation per item; later writes coalesce into it
//! - Operations execute in queue order, one per item at a time
//! - A failed push leaves every unexecuted operation queued
//! - Delta tokens only move forward, and only after rows are applied
//! - Engine bookkeeping lives in `__`-prefixed tables of the local store

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod action;
mod config;
mod context;
mod error;
mod handler;
mod lock;
mod operation;
mod operation_error;
mod queue;
mod remote;
mod result;
mod settings;

pub use action::{
    run_table_action, ActionCompletion, ActionLifecycle, ActionState, DirtyTable,
    IncrementalState, OperationBatch, PullAction, PullCursor, PullStats, PullStrategy,
    PurgeAction, PushAction, TableAction, TableActionOutcome,
};
pub use config::{PullOptions, RetryConfig, SyncConfig, DEFAULT_MAX_PAGE_SIZE};
pub use context::{PurgeOutcome, PushFilter, SyncContext, SyncContextBuilder};
pub use error::{PushFailedError, RemoteError, RemoteErrorKind, SyncError, SyncResult};
pub use handler::{DefaultSyncHandler, SyncHandler, TableOperation};
pub use lock::ScopedLock;
pub use operation::{Coalesced, OperationKind, OperationState, PendingOperation, TableKind};
pub use operation_error::{OperationError, SyncErrorStore};
pub use queue::OperationQueue;
pub use remote::{
    Parameters, ReadRequest, ReadResponse, RemoteFeatures, RemoteService, RemoteTable,
    SystemProperties,
};
pub use result::{PushCompletionResult, PushStatus};
pub use settings::{DeltaToken, SettingsStore, SyncSettings};
