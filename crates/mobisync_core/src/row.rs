//! Rows and their system columns.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// A table row: a JSON object keyed by column name.
pub type Row = Map<String, Value>;

/// Names of the columns the service and the sync engine manage.
pub mod columns {
    /// String primary key.
    pub const ID: &str = "id";
    /// Opaque optimistic-concurrency token assigned by the service.
    pub const VERSION: &str = "version";
    /// Last modification time (RFC 3339).
    pub const UPDATED_AT: &str = "updatedAt";
    /// Creation time (RFC 3339).
    pub const CREATED_AT: &str = "createdAt";
    /// Soft-delete flag.
    pub const DELETED: &str = "deleted";
    /// Prefix of local bookkeeping columns that never leave the device.
    pub const LOCAL_PREFIX: &str = "__";
}

/// Returns the row's id, if it is a non-empty string.
pub fn row_id(row: &Row) -> Option<&str> {
    row.get(columns::ID)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Returns the row's version token.
pub fn row_version(row: &Row) -> Option<&str> {
    row.get(columns::VERSION).and_then(Value::as_str)
}

/// Returns the row's `updatedAt` timestamp, if present and parseable.
pub fn row_updated_at(row: &Row) -> Option<DateTime<Utc>> {
    row.get(columns::UPDATED_AT)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
}

/// Returns true if the row is a tombstone.
pub fn is_tombstone(row: &Row) -> bool {
    row.get(columns::DELETED)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Formats a timestamp the way the service expects it (millisecond precision, `Z`).
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Removes service-managed and local bookkeeping columns from a row.
///
/// `id` is always kept. `version` is kept when `keep_version` is set, so an
/// update or delete can still be checked against the server copy.
pub fn strip_system_columns(row: &Row, keep_version: bool) -> Row {
    row.iter()
        .filter(|(name, _)| match name.as_str() {
            columns::ID => true,
            columns::VERSION => keep_version,
            columns::UPDATED_AT | columns::CREATED_AT | columns::DELETED => false,
            other => !other.starts_with(columns::LOCAL_PREFIX),
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn id_and_version() {
        let r = row(json!({"id": "a", "version": "AAAB"}));
        assert_eq!(row_id(&r), Some("a"));
        assert_eq!(row_version(&r), Some("AAAB"));

        let empty = row(json!({"id": ""}));
        assert_eq!(row_id(&empty), None);

        let numeric = row(json!({"id": 5}));
        assert_eq!(row_id(&numeric), None);
    }

    #[test]
    fn tombstones() {
        assert!(is_tombstone(&row(json!({"id": "a", "deleted": true}))));
        assert!(!is_tombstone(&row(json!({"id": "a", "deleted": false}))));
        assert!(!is_tombstone(&row(json!({"id": "a"}))));
    }

    #[test]
    fn timestamps() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let text = format_timestamp(ts);
        assert_eq!(text, "2024-03-01T12:30:00.000Z");
        assert_eq!(parse_timestamp(&text), Some(ts));

        let offset = parse_timestamp("2024-03-01T14:30:00+02:00").unwrap();
        assert_eq!(offset, ts);

        let r = row(json!({"id": "a", "updatedAt": text}));
        assert_eq!(row_updated_at(&r), Some(ts));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn strip_keeps_id_and_optionally_version() {
        let r = row(json!({
            "id": "a",
            "text": "hello",
            "version": "v1",
            "updatedAt": "2024-01-01T00:00:00.000Z",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "deleted": false,
            "__local": 1
        }));

        let stripped = strip_system_columns(&r, true);
        assert_eq!(stripped, row(json!({"id": "a", "text": "hello", "version": "v1"})));

        let stripped = strip_system_columns(&r, false);
        assert_eq!(stripped, row(json!({"id": "a", "text": "hello"})));
    }
}
