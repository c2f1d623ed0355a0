//! Coordinator Configuration

use serde::{Deserialize, Serialize};

use super::conflict::DEFAULT_HISTORY_CAPACITY;

/// Configuration for the action coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How often expired actions and conflicts are purged (ms)
    pub sweep_interval_ms: u64,
    /// Resolved conflicts kept in the history ring buffer
    pub history_capacity: usize,
    /// Width of the time bucket folded into conflict ids (ms). Peers that
    /// detect the same collision derive the same id only within one bucket.
    pub conflict_bucket_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            conflict_bucket_ms: 5_000,
        }
    }
}
