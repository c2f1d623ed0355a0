use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::debug;

use super::{KeyValueStore, StoreEvent, STORE_EVENT_CAPACITY};
use crate::error::StoreError;

/// Key-value store backed by a directory on the local filesystem.
///
/// Each key is stored at `{dir}/{hex(key)}.json`; hex keeps arbitrary keys
/// (namespaces contain `:` and `/`) filesystem-safe and reversible.
/// Change notifications only reach watchers inside this process.
pub struct FileStore {
    dir: PathBuf,
    events: broadcast::Sender<StoreEvent>,
}

impl FileStore {
    pub fn new(dir: &Path) -> Self {
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Self {
            dir: dir.to_path_buf(),
            events,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(key)))
    }

    fn io_err(key: &str, e: std::io::Error) -> StoreError {
        StoreError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| Self::io_err(key, e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }

        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(key, e))?;
        fs::write(self.entry_path(key), value).map_err(|e| Self::io_err(key, e))?;
        debug!("Stored {} ({} bytes) in {}", key, value.len(), self.dir.display());

        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Self::io_err(key, e))?;
            let _ = self.events.send(StoreEvent {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io_err(prefix, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(prefix, e))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            // Foreign files in the directory are skipped
            let Ok(raw) = hex::decode(stem) else {
                continue;
            };
            let Ok(key) = String::from_utf8(raw) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_roundtrip_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.set("tabsync:state:balance", "{\"a\":1}").unwrap();
        store.set("tabsync:state:alerts", "{}").unwrap();
        fs::write(dir.path().join("README.txt"), "not an entry").unwrap();

        assert_eq!(
            store.get("tabsync:state:balance").unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(
            store.keys("tabsync:state:").unwrap(),
            vec!["tabsync:state:alerts", "tabsync:state:balance"]
        );

        store.remove("tabsync:state:alerts").unwrap();
        assert!(store.get("tabsync:state:alerts").unwrap().is_none());
    }

    #[test]
    fn test_missing_dir_has_no_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&dir.path().join("absent"));
        assert!(store.keys("").unwrap().is_empty());
        assert!(store.get("x").unwrap().is_none());
    }
}
