//! Persistent sync settings (delta tokens).

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mobisync_core::{parse_timestamp, system_tables, LocalStore, QueryDescription, Row};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const DELTA_TOKEN_PREFIX: &str = "deltaToken";
const VALUE_COLUMN: &str = "value";

/// Storage for incremental pull progress.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The delta token of a query, or the Unix epoch if none was saved.
    async fn delta_token(&self, table: &str, query_id: &str) -> SyncResult<DateTime<Utc>>;

    /// Saves a delta token.
    async fn set_delta_token(
        &self,
        table: &str,
        query_id: &str,
        token: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Forgets a delta token so the next pull starts over.
    async fn reset_delta_token(&self, table: &str, query_id: &str) -> SyncResult<()>;
}

/// A saved delta token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaToken {
    /// Table name.
    pub table: String,
    /// Query id.
    pub query_id: String,
    /// High-water mark.
    pub value: DateTime<Utc>,
}

/// [`SettingsStore`] backed by the `__config` system table, with a cache.
pub struct SyncSettings {
    store: Arc<dyn LocalStore>,
    cache: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl SyncSettings {
    /// Creates settings over a local store.
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// `deltaToken|{table}|{query_id}`, with backslashes and `|` escaped
    /// inside the names so every pair gets its own key.
    fn key(table: &str, query_id: &str) -> String {
        format!("{DELTA_TOKEN_PREFIX}|{}|{}", escape(table), escape(query_id))
    }

    /// Lists every saved delta token.
    pub async fn delta_tokens(&self) -> SyncResult<Vec<DeltaToken>> {
        let rows = self
            .store
            .read(&QueryDescription::new(system_tables::CONFIG).including_deleted())
            .await?;

        let mut tokens = Vec::new();
        for row in rows {
            let Some(key) = row.get("id").and_then(Value::as_str) else {
                continue;
            };
            let [prefix, table, query_id]: [String; 3] = match split_key(key).try_into() {
                Ok(parts) => parts,
                Err(_) => continue,
            };
            if prefix != DELTA_TOKEN_PREFIX {
                continue;
            }
            tokens.push(DeltaToken {
                table,
                query_id,
                value: Self::decode(key, &row)?,
            });
        }
        Ok(tokens)
    }

    fn decode(key: &str, row: &Row) -> SyncResult<DateTime<Utc>> {
        row.get(VALUE_COLUMN)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| SyncError::invalid_operation(format!("setting {key} is not a timestamp")))
    }
}

fn escape(part: &str) -> String {
    part.replace('\\', "\\\\").replace('|', "\\|")
}

/// Splits a key on unescaped `|` and unescapes the parts.
fn split_key(key: &str) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let (Some(next), Some(part)) = (chars.next(), parts.last_mut()) {
                    part.push(next);
                }
            }
            '|' => parts.push(String::new()),
            _ => {
                if let Some(part) = parts.last_mut() {
                    part.push(c);
                }
            }
        }
    }
    parts
}

#[async_trait]
impl SettingsStore for SyncSettings {
    async fn delta_token(&self, table: &str, query_id: &str) -> SyncResult<DateTime<Utc>> {
        let key = Self::key(table, query_id);
        if let Some(token) = self.cache.read().get(&key) {
            return Ok(*token);
        }

        let token = match self.store.lookup(system_tables::CONFIG, &key).await? {
            Some(row) => Self::decode(&key, &row)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        self.cache.write().insert(key, token);
        Ok(token)
    }

    async fn set_delta_token(
        &self,
        table: &str,
        query_id: &str,
        token: DateTime<Utc>,
    ) -> SyncResult<()> {
        let key = Self::key(table, query_id);
        let mut row = Row::new();
        row.insert("id".into(), Value::String(key.clone()));
        row.insert(
            VALUE_COLUMN.into(),
            Value::String(token.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        self.store
            .upsert(system_tables::CONFIG, &[row], false)
            .await?;

        debug!(table, query_id, token = %token, "saved delta token");
        self.cache.write().insert(key, token);
        Ok(())
    }

    async fn reset_delta_token(&self, table: &str, query_id: &str) -> SyncResult<()> {
        let key = Self::key(table, query_id);
        self.store
            .delete(system_tables::CONFIG, &[key.clone()])
            .await?;
        debug!(table, query_id, "reset delta token");
        self.cache.write().remove(&key);
        Ok(())
    }
}

impl std::fmt::Debug for SyncSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSettings")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mobisync_core::MemoryStore;

    #[tokio::test]
    async fn default_token_is_epoch() {
        let settings = SyncSettings::new(Arc::new(MemoryStore::new()));
        let token = settings.delta_token("todo", "all").await.unwrap();
        assert_eq!(token, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn tokens_persist_across_instances() {
        let store = Arc::new(MemoryStore::new());
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        SyncSettings::new(store.clone())
            .set_delta_token("todo", "all", ts)
            .await
            .unwrap();

        let settings = SyncSettings::new(store);
        assert_eq!(settings.delta_token("todo", "all").await.unwrap(), ts);
        assert_eq!(
            settings.delta_tokens().await.unwrap(),
            vec![DeltaToken {
                table: "todo".into(),
                query_id: "all".into(),
                value: ts,
            }]
        );
    }

    #[tokio::test]
    async fn reset_clears_cache_and_store() {
        let store = Arc::new(MemoryStore::new());
        let settings = SyncSettings::new(store.clone());
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        settings.set_delta_token("todo", "all", ts).await.unwrap();
        settings.reset_delta_token("todo", "all").await.unwrap();

        assert_eq!(
            settings.delta_token("todo", "all").await.unwrap(),
            DateTime::<Utc>::UNIX_EPOCH
        );
        assert_eq!(store.row_count(system_tables::CONFIG), 0);
    }

    #[tokio::test]
    async fn sub_millisecond_precision_survives() {
        let settings = SyncSettings::new(Arc::new(MemoryStore::new()));
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        settings.set_delta_token("todo", "q", ts).await.unwrap();

        let fresh = SyncSettings::new(settings.store.clone());
        assert_eq!(fresh.delta_token("todo", "q").await.unwrap(), ts);
    }

    #[tokio::test]
    async fn separators_in_names_do_not_collide() {
        let settings = SyncSettings::new(Arc::new(MemoryStore::new()));
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();

        settings.set_delta_token("a|b", "c", first).await.unwrap();
        settings.set_delta_token("a", "b|c", second).await.unwrap();
        settings.set_delta_token("x\\", "y", second).await.unwrap();

        assert_eq!(settings.delta_token("a|b", "c").await.unwrap(), first);
        assert_eq!(settings.delta_token("a", "b|c").await.unwrap(), second);

        let mut tokens = settings.delta_tokens().await.unwrap();
        tokens.sort_by(|l, r| l.table.cmp(&r.table));
        let names: Vec<_> = tokens
            .iter()
            .map(|t| (t.table.as_str(), t.query_id.as_str()))
            .collect();
        assert_eq!(names, vec![("a", "b|c"), ("a|b", "c"), ("x\\", "y")]);
    }
}
