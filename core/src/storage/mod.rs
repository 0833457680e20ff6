mod memory;
mod storage_trait;
mod types;

pub use memory::MemoryStateSystem;
pub use storage_trait::StateSystem;
pub use types::*;

use crate::config::StoreConfig;
use anyhow::Result;
use std::sync::Arc;

/// Create a state system based on the configuration
pub fn create_state_system(
    config: &StoreConfig,
    start_time: Timestamp,
) -> Result<Arc<dyn StateSystem>> {
    match config.backend.as_str() {
        "memory" => {
            tracing::debug!(start_time, "creating in-memory state system");
            Ok(Arc::new(MemoryStateSystem::with_config(start_time, config)))
        }
        other => {
            anyhow::bail!("Unknown store backend: {}", other)
        }
    }
}
