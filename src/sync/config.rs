//! Synchronizer Configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::category::StateCategory;

/// Configuration for the state synchronizer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix for every store key this peer writes
    pub namespace: String,
    /// How often the debounce timer checks for due broadcasts (ms)
    pub timer_resolution_ms: u64,
    /// Static per-category debounce overrides (ms), keyed by category name
    pub debounce_overrides: HashMap<StateCategory, u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "tabsync:".to_string(),
            timer_resolution_ms: 50,
            debounce_overrides: HashMap::new(),
        }
    }
}

impl SyncConfig {
    pub fn debounce_for(&self, category: StateCategory) -> u64 {
        self.debounce_overrides
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_debounce_ms())
    }

    /// Store key prefix for persisted categories
    pub fn state_prefix(&self) -> String {
        format!("{}state:", self.namespace)
    }

    pub fn storage_key(&self, category: StateCategory) -> String {
        format!("{}{}", self.state_prefix(), category.as_str())
    }
}
