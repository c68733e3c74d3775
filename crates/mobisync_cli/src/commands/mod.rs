//! CLI command implementations.

pub mod errors;
pub mod queue;
pub mod tokens;

use mobisync_core::MemoryStore;
use std::path::Path;
use std::sync::Arc;

/// Opens an existing store snapshot.
pub fn open_store(path: &Path) -> Result<Arc<MemoryStore>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("store snapshot not found: {}", path.display()).into());
    }
    Ok(Arc::new(MemoryStore::open(path)?))
}
