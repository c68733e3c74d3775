//! Queue command implementation.

use super::open_store;
use mobisync_core::{system_tables, LocalStore, QueryDescription};
use mobisync_sync_engine::PendingOperation;
use serde::Serialize;
use std::path::Path;

/// Pending operation representation for output.
#[derive(Debug, Serialize)]
pub struct OperationInfo {
    /// Queue position.
    pub sequence: u64,
    /// Target table.
    pub table: String,
    /// Target item.
    pub item_id: String,
    /// Mutation kind.
    pub kind: String,
    /// Execution state.
    pub state: String,
    /// Operation version.
    pub version: u64,
    /// When the operation was queued (RFC 3339).
    pub created_at: String,
}

impl From<&PendingOperation> for OperationInfo {
    fn from(op: &PendingOperation) -> Self {
        Self {
            sequence: op.sequence,
            table: op.table.clone(),
            item_id: op.item_id.clone(),
            kind: op.kind.to_string(),
            state: format!("{:?}", op.state).to_lowercase(),
            version: op.version,
            created_at: mobisync_core::format_timestamp(op.created_at),
        }
    }
}

/// Runs the queue command.
pub async fn run(
    path: &Path,
    table: Option<&str>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;

    // Read the rows directly so inspecting never rewrites the snapshot.
    let rows = store
        .read(&QueryDescription::new(system_tables::OPERATIONS).including_deleted())
        .await?;
    let mut operations = rows
        .iter()
        .map(PendingOperation::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    operations.retain(|op| !op.cancelled && table.map_or(true, |t| op.table == t));
    operations.sort_by_key(|op| op.sequence);

    let infos: Vec<OperationInfo> = operations.iter().map(OperationInfo::from).collect();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        _ => {
            print_text_output(&infos);
        }
    }

    Ok(())
}

fn print_text_output(infos: &[OperationInfo]) {
    println!("Pending Operations");
    println!("==================");
    println!();

    if infos.is_empty() {
        println!("(queue is empty)");
        return;
    }

    println!(
        "{:>6}  {:<16} {:<36} {:<7} {:<9} {:>4}",
        "SEQ", "TABLE", "ITEM", "KIND", "STATE", "VER"
    );
    for info in infos {
        println!(
            "{:>6}  {:<16} {:<36} {:<7} {:<9} {:>4}",
            info.sequence, info.table, info.item_id, info.kind, info.state, info.version
        );
    }
    println!();
    println!("{} operation(s)", infos.len());
}
