//! # MobiSync Core
//!
//! Row model and local store abstraction for MobiSync.
//!
//! This crate provides:
//! - `Row`, the JSON object every table holds, and its system columns
//! - `QueryDescription` and `Filter` for table-scoped queries
//! - The `LocalStore` trait the sync engine persists through
//! - `MemoryStore`, an in-memory store with optional file snapshots
//!
//! The sync engine keeps its own bookkeeping (pending operations, sync
//! errors, delta tokens) in system tables of the same store, so a store
//! snapshot carries the whole offline state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod query;
mod row;
mod store;

pub use error::{CoreError, CoreResult};
pub use memory::MemoryStore;
pub use query::{compare_values, CompareOp, Filter, OrderBy, QueryDescription, SortDirection};
pub use row::{
    columns, format_timestamp, is_tombstone, parse_timestamp, row_id, row_updated_at, row_version,
    strip_system_columns, Row,
};
pub use store::{system_tables, LocalStore};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
