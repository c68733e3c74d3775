//! A scriptable in-memory remote table service.
//!
//! `MockRemote` behaves like a real table service: it assigns versions and
//! `updatedAt` stamps, soft-deletes rows, checks optimistic-concurrency
//! versions, and pages large results. Failures can be injected per call.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use mobisync_core::{columns, format_timestamp, row_id, row_version, QueryDescription, Row};
use mobisync_sync_engine::{ReadRequest, ReadResponse, RemoteError, RemoteFeatures, RemoteService};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A request received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// `read`.
    Read {
        /// Table name.
        table: String,
        /// The query as received.
        query: QueryDescription,
    },
    /// `read_link`.
    ReadLink {
        /// Table name.
        table: String,
        /// The followed link.
        link: String,
    },
    /// `insert`.
    Insert {
        /// Table name.
        table: String,
        /// Item id.
        id: String,
    },
    /// `update`.
    Update {
        /// Table name.
        table: String,
        /// Item id.
        id: String,
    },
    /// `delete`.
    Delete {
        /// Table name.
        table: String,
        /// Item id.
        id: String,
    },
}

impl RemoteCall {
    /// Table the call targeted.
    pub fn table(&self) -> &str {
        match self {
            RemoteCall::Read { table, .. }
            | RemoteCall::ReadLink { table, .. }
            | RemoteCall::Insert { table, .. }
            | RemoteCall::Update { table, .. }
            | RemoteCall::Delete { table, .. } => table,
        }
    }

    /// Item id of a mutation.
    pub fn item_id(&self) -> Option<&str> {
        match self {
            RemoteCall::Insert { id, .. }
            | RemoteCall::Update { id, .. }
            | RemoteCall::Delete { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Returns true for insert, update and delete.
    pub fn is_mutation(&self) -> bool {
        self.item_id().is_some()
    }
}

type Matcher = Box<dyn Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync>;

struct FailureRule {
    matcher: Matcher,
    remaining: Option<usize>,
}

struct ServerState {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
    clock: DateTime<Utc>,
    links: HashMap<String, ReadRequest>,
}

impl ServerState {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += ChronoDuration::seconds(1);
        self.clock
    }
}

/// In-memory [`RemoteService`] for tests.
pub struct MockRemote {
    state: Mutex<ServerState>,
    failures: Mutex<Vec<FailureRule>>,
    calls: Mutex<Vec<RemoteCall>>,
    features: Mutex<HashMap<String, RemoteFeatures>>,
    page_limit: Mutex<Option<usize>>,
    latency: Mutex<Option<Duration>>,
    offline: AtomicBool,
}

impl MockRemote {
    /// Creates an empty service whose clock starts at [`MockRemote::epoch`].
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState {
                tables: BTreeMap::new(),
                clock: Self::epoch(),
                links: HashMap::new(),
            }),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            features: Mutex::new(HashMap::new()),
            page_limit: Mutex::new(None),
            latency: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    /// Start of the server clock. Every write advances it by one second.
    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
    }

    /// Current server time.
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().clock
    }

    // Server-side data

    /// Adds rows as if another client created them.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock();
        for mut row in rows {
            let Some(id) = row_id(&row).map(str::to_string) else {
                continue;
            };
            let now = state.tick();
            row.entry(columns::VERSION)
                .or_insert_with(|| Value::String("1".into()));
            row.entry(columns::CREATED_AT)
                .or_insert_with(|| Value::String(format_timestamp(now)));
            row.entry(columns::UPDATED_AT)
                .or_insert_with(|| Value::String(format_timestamp(now)));
            row.entry(columns::DELETED).or_insert(Value::Bool(false));
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(id, row);
        }
    }

    /// Changes a server row as if another client updated it.
    pub fn edit(&self, table: &str, id: &str, changes: Row) -> Option<Row> {
        let mut state = self.state.lock();
        let now = state.tick();
        let row = state.tables.get_mut(table)?.get_mut(id)?;
        for (column, value) in changes {
            row.insert(column, value);
        }
        stamp(row, now);
        Some(row.clone())
    }

    /// Soft-deletes a server row as if another client deleted it.
    pub fn remove(&self, table: &str, id: &str) -> bool {
        let mut state = self.state.lock();
        let now = state.tick();
        match state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) => {
                row.insert(columns::DELETED.into(), Value::Bool(true));
                stamp(row, now);
                true
            }
            None => false,
        }
    }

    /// A server row, tombstones included.
    pub fn row(&self, table: &str, id: &str) -> Option<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Live (non-deleted) server rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| !mobisync_core::is_tombstone(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // Behavior

    /// Overrides the capabilities of a table.
    pub fn set_features(&self, table: &str, features: RemoteFeatures) {
        self.features.lock().insert(table.to_string(), features);
    }

    /// Caps rows per response; larger results get a next link.
    pub fn set_page_limit(&self, limit: usize) {
        *self.page_limit.lock() = Some(limit);
    }

    /// Delays every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Fails every call with a network error until [`go_online`](Self::go_online).
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    /// Stops failing calls with network errors.
    pub fn go_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Fails every call for which `matcher` returns an error.
    pub fn fail_when<F>(&self, matcher: F)
    where
        F: Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync + 'static,
    {
        self.failures.lock().push(FailureRule {
            matcher: Box::new(matcher),
            remaining: None,
        });
    }

    /// Fails the first call for which `matcher` returns an error.
    pub fn fail_once<F>(&self, matcher: F)
    where
        F: Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync + 'static,
    {
        self.failures.lock().push(FailureRule {
            matcher: Box::new(matcher),
            remaining: Some(1),
        });
    }

    /// Fails the `n`-th mutation (1-based) with `error`.
    pub fn fail_nth_mutation(&self, n: usize, error: RemoteError) {
        let seen = AtomicUsize::new(0);
        self.fail_once(move |call| {
            if !call.is_mutation() {
                return None;
            }
            (seen.fetch_add(1, Ordering::SeqCst) + 1 == n).then(|| error.clone())
        });
    }

    /// Fails every mutation of one item with `error`.
    pub fn fail_item(&self, item_id: &str, error: RemoteError) {
        let item_id = item_id.to_string();
        self.fail_when(move |call| (call.item_id() == Some(item_id.as_str())).then(|| error.clone()));
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    // Call log

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Mutation calls received so far.
    pub fn mutations(&self) -> Vec<RemoteCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    /// Read calls (including followed links) received so far.
    pub fn reads(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| !call.is_mutation())
            .count()
    }

    /// Forgets the call log.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    async fn enter(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        self.calls.lock().push(call.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::network("service unreachable"));
        }

        let mut failures = self.failures.lock();
        let mut index = 0;
        while index < failures.len() {
            if let Some(error) = (failures[index].matcher)(&call) {
                if let Some(remaining) = failures[index].remaining.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        failures.remove(index);
                    }
                }
                return Err(error);
            }
            index += 1;
        }
        Ok(())
    }

    fn run_query(&self, table: &str, request: &ReadRequest) -> ReadResponse {
        let limit = *self.page_limit.lock();
        let next_links = self.features(table).next_links;

        let mut state = self.state.lock();
        let mut rows = state
            .tables
            .get(table)
            .map(|rows| request.query.apply(rows.values()))
            .unwrap_or_default();

        let Some(limit) = limit.filter(|limit| rows.len() > *limit) else {
            return ReadResponse::new(rows);
        };
        rows.truncate(limit);
        if !next_links {
            return ReadResponse::new(rows);
        }

        let mut next = request.clone();
        next.query.skip = Some(request.query.skip.unwrap_or(0) + limit as u64);
        next.query.top = request.query.top.map(|top| top.saturating_sub(limit as u64));
        let link = format!("mock://{table}/page/{}", state.links.len() + 1);
        state.links.insert(link.clone(), next);
        ReadResponse::new(rows).with_next_link(link)
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn stamp(row: &mut Row, now: DateTime<Utc>) {
    let version = row_version(row)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    row.insert(columns::VERSION.into(), Value::String((version + 1).to_string()));
    row.insert(columns::UPDATED_AT.into(), Value::String(format_timestamp(now)));
}

fn item_id(item: &Row) -> Result<String, RemoteError> {
    row_id(item)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::rejected(400, "item has no id"))
}

fn check_version(item: &Row, server: &Row) -> Result<(), RemoteError> {
    match row_version(item) {
        Some(version) if Some(version) != row_version(server) => {
            Err(RemoteError::precondition_failed(server.clone()))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn read(&self, table: &str, request: &ReadRequest) -> Result<ReadResponse, RemoteError> {
        self.enter(RemoteCall::Read {
            table: table.to_string(),
            query: request.query.clone(),
        })
        .await?;
        Ok(self.run_query(table, request))
    }

    async fn read_link(&self, table: &str, link: &str) -> Result<ReadResponse, RemoteError> {
        self.enter(RemoteCall::ReadLink {
            table: table.to_string(),
            link: link.to_string(),
        })
        .await?;
        let request = self
            .state
            .lock()
            .links
            .get(link)
            .cloned()
            .ok_or_else(|| RemoteError::rejected(404, format!("unknown link {link}")))?;
        Ok(self.run_query(table, &request))
    }

    async fn insert(&self, table: &str, item: &Row) -> Result<Row, RemoteError> {
        let id = item_id(item)?;
        self.enter(RemoteCall::Insert {
            table: table.to_string(),
            id: id.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        if let Some(existing) = state.tables.get(table).and_then(|rows| rows.get(&id)) {
            if !mobisync_core::is_tombstone(existing) {
                return Err(RemoteError::conflict(existing.clone()));
            }
        }

        let now = state.tick();
        let mut row = item.clone();
        row.insert(columns::VERSION.into(), Value::String("1".into()));
        row.insert(columns::CREATED_AT.into(), Value::String(format_timestamp(now)));
        row.insert(columns::UPDATED_AT.into(), Value::String(format_timestamp(now)));
        row.insert(columns::DELETED.into(), Value::Bool(false));
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, item: &Row) -> Result<Row, RemoteError> {
        let id = item_id(item)?;
        self.enter(RemoteCall::Update {
            table: table.to_string(),
            id: id.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let now = state.tick();
        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .filter(|row| !mobisync_core::is_tombstone(row))
            .ok_or_else(|| RemoteError::rejected(404, format!("item {id} not found")))?;
        check_version(item, row)?;

        for (column, value) in item {
            if column != columns::VERSION {
                row.insert(column.clone(), value.clone());
            }
        }
        stamp(row, now);
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, item: &Row) -> Result<Option<Row>, RemoteError> {
        let id = item_id(item)?;
        self.enter(RemoteCall::Delete {
            table: table.to_string(),
            id: id.clone(),
        })
        .await?;

        let mut state = self.state.lock();
        let now = state.tick();
        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .filter(|row| !mobisync_core::is_tombstone(row))
            .ok_or_else(|| RemoteError::rejected(404, format!("item {id} not found")))?;
        check_version(item, row)?;

        row.insert(columns::DELETED.into(), Value::Bool(true));
        stamp(row, now);
        Ok(None)
    }

    fn features(&self, table: &str) -> RemoteFeatures {
        self.features
            .lock()
            .get(table)
            .copied()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("calls", &self.calls.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobisync_sync_engine::{RemoteErrorKind, SystemProperties};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn request(query: QueryDescription) -> ReadRequest {
        ReadRequest {
            query,
            parameters: Default::default(),
            system_properties: SystemProperties::NONE,
        }
    }

    #[tokio::test]
    async fn insert_assigns_system_columns() {
        let remote = MockRemote::new();
        let created = remote.insert("todo", &row(json!({"id": "a"}))).await.unwrap();
        assert_eq!(created["version"], json!("1"));
        assert_eq!(created["deleted"], json!(false));
        assert!(created.contains_key("updatedAt"));

        let err = remote.insert("todo", &row(json!({"id": "a"}))).await.unwrap_err();
        assert_eq!(err.status, Some(409));
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let remote = MockRemote::new();
        remote.seed("todo", [row(json!({"id": "a", "text": "x"}))]);
        remote.edit("todo", "a", row(json!({"text": "y"})));

        let err = remote
            .update("todo", &row(json!({"id": "a", "version": "1", "text": "z"})))
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(412));
        assert_eq!(err.value.unwrap()["text"], json!("y"));

        let updated = remote
            .update("todo", &row(json!({"id": "a", "version": "2", "text": "z"})))
            .await
            .unwrap();
        assert_eq!(updated["version"], json!("3"));
    }

    #[tokio::test]
    async fn delete_is_soft() {
        let remote = MockRemote::new();
        remote.seed("todo", [row(json!({"id": "a"}))]);
        remote.delete("todo", &row(json!({"id": "a"}))).await.unwrap();

        assert!(remote.rows("todo").is_empty());
        assert_eq!(remote.row("todo", "a").unwrap()["deleted"], json!(true));
    }

    #[tokio::test]
    async fn large_results_are_linked() {
        let remote = MockRemote::new();
        remote.set_page_limit(2);
        remote.seed("todo", (0..5).map(|i| row(json!({"id": format!("r{i}")}))));

        let first = remote.read("todo", &request(QueryDescription::new("todo"))).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let link = first.next_link.unwrap();

        let second = remote.read_link("todo", &link).await.unwrap();
        assert_eq!(second.rows[0]["id"], json!("r2"));
        assert!(second.next_link.is_some());
    }

    #[tokio::test]
    async fn injected_failures() {
        let remote = MockRemote::new();
        remote.fail_nth_mutation(2, RemoteError::network("boom"));

        remote.insert("todo", &row(json!({"id": "a"}))).await.unwrap();
        let err = remote.insert("todo", &row(json!({"id": "b"}))).await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Network);
        remote.insert("todo", &row(json!({"id": "c"}))).await.unwrap();

        remote.go_offline();
        assert!(remote.read("todo", &request(QueryDescription::new("todo"))).await.is_err());
        remote.go_online();
        assert_eq!(remote.mutations().len(), 3);
    }
}
