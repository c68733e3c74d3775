//! Delta token command implementations.

use super::open_store;
use mobisync_sync_engine::{DeltaToken, SettingsStore, SyncSettings};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Delta token representation for output.
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    /// Table name.
    pub table: String,
    /// Query id.
    pub query_id: String,
    /// High-water mark (RFC 3339).
    pub value: String,
}

impl From<&DeltaToken> for TokenInfo {
    fn from(token: &DeltaToken) -> Self {
        Self {
            table: token.table.clone(),
            query_id: token.query_id.clone(),
            value: mobisync_core::format_timestamp(token.value),
        }
    }
}

/// Runs the tokens command.
pub async fn list(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let tokens = SyncSettings::new(store).delta_tokens().await?;
    let infos: Vec<TokenInfo> = tokens.iter().map(TokenInfo::from).collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        _ => {
            println!("Delta Tokens");
            println!("============");
            println!();
            if infos.is_empty() {
                println!("(none)");
            }
            for info in &infos {
                println!("{:<20} {:<24} {}", info.table, info.query_id, info.value);
            }
        }
    }

    Ok(())
}

/// Runs the reset-token command.
pub async fn reset(
    path: &Path,
    table: &str,
    query_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    SyncSettings::new(store).reset_delta_token(table, query_id).await?;
    info!(table, query_id, "delta token reset");
    Ok(())
}
