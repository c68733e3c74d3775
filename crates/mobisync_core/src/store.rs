//! Local store abstraction.

use crate::error::CoreResult;
use crate::query::QueryDescription;
use crate::row::Row;
use async_trait::async_trait;

/// Tables the sync engine reserves for its own bookkeeping.
///
/// All of them start with `__` so they never collide with application tables.
pub mod system_tables {
    /// Pending operation queue.
    pub const OPERATIONS: &str = "__operations";
    /// Recorded push failures awaiting acknowledgement.
    pub const ERRORS: &str = "__errors";
    /// Sync settings such as delta tokens.
    pub const CONFIG: &str = "__config";

    /// Returns true if the table is reserved for sync bookkeeping.
    pub fn is_system_table(name: &str) -> bool {
        name.starts_with("__")
    }
}

/// Persistent storage for table rows.
///
/// Implementations must make every single call atomic: either all rows of
/// an `upsert` or `delete` are applied, or none are.
///
/// `from_server` marks writes that originate from a pull or a push result.
/// Those writes reflect server state and must never be treated as local
/// changes that need to be sent back.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Inserts or replaces rows by id. Existing columns not present in the
    /// new row are kept.
    async fn upsert(&self, table: &str, rows: &[Row], from_server: bool) -> CoreResult<()>;

    /// Deletes rows by id. Unknown ids are ignored.
    async fn delete(&self, table: &str, ids: &[String]) -> CoreResult<()>;

    /// Deletes every row matching the query and returns how many were removed.
    async fn delete_query(&self, query: &QueryDescription) -> CoreResult<u64>;

    /// Looks up a single row.
    async fn lookup(&self, table: &str, id: &str) -> CoreResult<Option<Row>>;

    /// Reads rows matching the query.
    async fn read(&self, query: &QueryDescription) -> CoreResult<Vec<Row>>;
}
