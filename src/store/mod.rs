//! Local key-value persistence
//!
//! The shared store plays two roles: it holds one serialized entry per state
//! category, and its change feed carries the fallback transport when no native
//! broadcast primitive is available.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use tokio::sync::broadcast;

use crate::error::StoreError;

/// Capacity of the change feed each store exposes
pub const STORE_EVENT_CAPACITY: usize = 256;

/// A change notification emitted after every successful write or removal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    /// New value, or `None` when the key was removed
    pub value: Option<String>,
}

/// Synchronous string store shared by every peer of a user
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;

    /// Remove every key under `prefix`, returning how many were removed
    fn clear_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let keys = self.keys(prefix)?;
        for key in &keys {
            self.remove(key)?;
        }
        Ok(keys.len())
    }
}
