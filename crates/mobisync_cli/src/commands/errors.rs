//! Errors command implementation.

use super::open_store;
use mobisync_sync_engine::{OperationError, SyncErrorStore};
use std::path::Path;

/// Runs the errors command.
pub async fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(path)?;
    let errors = SyncErrorStore::new(store).load().await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&errors)?);
        }
        _ => {
            print_text_output(&errors);
        }
    }

    Ok(())
}

fn print_text_output(errors: &[OperationError]) {
    println!("Recorded Push Failures");
    println!("======================");
    println!();

    if errors.is_empty() {
        println!("(none)");
        return;
    }

    for error in errors {
        let status = error
            .status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{} {}/{} [{}] status={} handled={}",
            error.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            error.table,
            error.item_id,
            error.operation_kind,
            status,
            error.handled
        );
        println!("    {}", error.message);
    }
}
