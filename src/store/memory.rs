//! In-memory store shared by peers running in one process

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use super::{KeyValueStore, StoreEvent, STORE_EVENT_CAPACITY};
use crate::error::StoreError;

/// DashMap-backed store with an optional byte quota
pub struct MemoryStore {
    entries: DashMap<String, String>,
    events: broadcast::Sender<StoreEvent>,
    /// Maximum total bytes of keys + values (0 = unlimited)
    quota_bytes: usize,
    used_bytes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_quota(0)
    }

    /// Create a store that rejects writes once `quota_bytes` would be exceeded
    pub fn with_quota(quota_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            events,
            quota_bytes,
            used_bytes: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn check_quota(&self, old_size: usize, new_size: usize) -> Result<(), StoreError> {
        if self.quota_bytes == 0 {
            return Ok(());
        }
        let projected = self.used_bytes().saturating_sub(old_size) + new_size;
        if projected > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                requested: new_size,
                quota: self.quota_bytes,
            });
        }
        Ok(())
    }

    fn notify(&self, key: &str, value: Option<String>) {
        // No watchers is fine
        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            value,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }

        let new_size = key.len() + value.len();

        // The entry guard serializes writers of the same key; the byte count
        // is swapped before it drops so it never goes below this key's share.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let old_size = key.len() + entry.get().len();
                self.check_quota(old_size, new_size)?;
                entry.insert(value.to_string());
                self.used_bytes.fetch_add(new_size, Ordering::SeqCst);
                self.used_bytes.fetch_sub(old_size, Ordering::SeqCst);
            }
            Entry::Vacant(entry) => {
                self.check_quota(0, new_size)?;
                let _guard = entry.insert(value.to_string());
                self.used_bytes.fetch_add(new_size, Ordering::SeqCst);
            }
        }
        debug!("store set {} ({} bytes)", key, value.len());

        self.notify(key, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if let Some((k, v)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::SeqCst);
            self.notify(key, None);
        }
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
