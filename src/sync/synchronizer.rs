//! State Synchronizer
//!
//! Keeps one [`StateRecord`] per category on this peer, persists it to the
//! local store, and replicates it to other peers of the same user with a
//! trailing per-category debounce. Incoming updates go through a staleness
//! guard: a message whose timestamp is not strictly greater than the held
//! record's is dropped without notifying anyone.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::category::{StateCategory, StateRecord, StoredState, SyncOptions, UpdateSource};
use super::config::SyncConfig;
use super::listeners::{ListenerHandle, ListenerRegistry, StateListener};
use crate::clock::Clock;
use crate::error::{Result, TabSyncError};
use crate::store::KeyValueStore;
use crate::transport::{Channel, ChannelName, Envelope, PeerId, Transport};

/// Envelope type of every replicated state message
pub const STATE_SYNC_MESSAGE: &str = "state_sync";

/// Payload of a `state_sync` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncPayload {
    pub category: StateCategory,
    pub state: serde_json::Value,
    pub timestamp: u64,
}

/// A coalesced broadcast waiting for its debounce deadline
#[derive(Debug, Clone)]
struct PendingBroadcast {
    due_at: u64,
    record: StateRecord,
}

#[derive(Debug, Default)]
struct SyncCounters {
    local_updates: AtomicU64,
    remote_applied: AtomicU64,
    stale_rejected: AtomicU64,
    broadcasts_sent: AtomicU64,
    persist_failures: AtomicU64,
}

/// Synchronizer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub tracked_categories: usize,
    pub pending_broadcasts: usize,
    pub local_updates: u64,
    pub remote_applied: u64,
    pub stale_rejected: u64,
    pub broadcasts_sent: u64,
    pub persist_failures: u64,
}

pub struct StateSynchronizer {
    peer_id: PeerId,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    channels: HashMap<ChannelName, Channel>,
    records: RwLock<HashMap<StateCategory, StateRecord>>,
    pending: RwLock<HashMap<StateCategory, PendingBroadcast>>,
    listeners: ListenerRegistry,
    counters: SyncCounters,
}

impl StateSynchronizer {
    pub fn new(
        transport: &Transport,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let channels = StateCategory::channels()
            .into_iter()
            .map(|name| (name, transport.open_channel(name)))
            .collect();

        Self {
            peer_id: transport.peer_id().clone(),
            config,
            clock,
            store,
            channels,
            records: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            counters: SyncCounters::default(),
        }
    }

    /// Channels this synchronizer publishes on and listens to
    pub fn channels(&self) -> Vec<Channel> {
        StateCategory::channels()
            .into_iter()
            .filter_map(|name| self.channels.get(&name).cloned())
            .collect()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Update a category from local code
    pub async fn sync_state(
        &self,
        category: StateCategory,
        value: serde_json::Value,
        options: SyncOptions,
    ) -> Result<StateRecord> {
        self.sync_state_from(category, value, options, UpdateSource::LocalUpdate)
            .await
    }

    /// Update a category with an explicit provenance tag
    pub async fn sync_state_from(
        &self,
        category: StateCategory,
        value: serde_json::Value,
        options: SyncOptions,
        source: UpdateSource,
    ) -> Result<StateRecord> {
        let now = self.clock.now_ms();

        let record = {
            let mut records = self.records.write().await;
            let timestamp = match records.get(&category) {
                Some(current) => now.max(current.timestamp + 1),
                None => now,
            };
            let record = StateRecord {
                category,
                value,
                timestamp,
                origin_peer: self.peer_id.clone(),
            };
            records.insert(category, record.clone());
            record
        };
        self.counters.local_updates.fetch_add(1, Ordering::Relaxed);

        if options.persist {
            self.persist(&record);
        }

        self.listeners.notify(category, &record.value, source);

        if options.broadcast {
            if options.immediate {
                self.pending.write().await.remove(&category);
                self.publish(&record);
            } else {
                let delay = options
                    .debounce_ms
                    .unwrap_or_else(|| self.config.debounce_for(category));
                // Trailing debounce: the newest value replaces the queued one
                // and pushes the deadline out again.
                self.pending.write().await.insert(
                    category,
                    PendingBroadcast {
                        due_at: now + delay,
                        record: record.clone(),
                    },
                );
                debug!("{} update queued, due in {}ms", category, delay);
            }
        }

        Ok(record)
    }

    /// Register a listener for every accepted update of `category`
    pub fn add_state_listener<F>(&self, category: StateCategory, listener: F) -> ListenerHandle
    where
        F: Fn(&serde_json::Value, UpdateSource, StateCategory) + Send + Sync + 'static,
    {
        let listener: StateListener = Arc::new(listener);
        self.listeners.add(category, listener)
    }

    pub fn listener_count(&self, category: StateCategory) -> usize {
        self.listeners.count(category)
    }

    /// Apply a remote `state_sync` message. Returns whether it was adopted.
    pub async fn handle_remote(&self, envelope: &Envelope) -> Result<bool> {
        if envelope.kind != STATE_SYNC_MESSAGE {
            return Ok(false);
        }
        let payload: StateSyncPayload = serde_json::from_value(envelope.data.clone())?;
        let category = payload.category;
        let timestamp = envelope.timestamp;

        let record = {
            let mut records = self.records.write().await;
            if let Some(current) = records.get(&category) {
                if timestamp <= current.timestamp {
                    self.counters.stale_rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Dropping stale {} from {} ({} <= {})",
                        category, envelope.origin, timestamp, current.timestamp
                    );
                    return Ok(false);
                }
            }
            let record = StateRecord {
                category,
                value: payload.state,
                timestamp,
                origin_peer: envelope.origin.clone(),
            };
            records.insert(category, record.clone());
            record
        };
        self.counters.remote_applied.fetch_add(1, Ordering::Relaxed);

        // A queued local value is now older than what we hold
        self.pending.write().await.remove(&category);

        self.persist(&record);
        self.listeners
            .notify(category, &record.value, UpdateSource::RemoteUpdate);
        Ok(true)
    }

    /// Publish every queued broadcast whose deadline has passed
    pub async fn flush_due(&self) -> usize {
        let now = self.clock.now_ms();
        let due: Vec<StateRecord> = {
            let mut pending = self.pending.write().await;
            let categories: Vec<StateCategory> = pending
                .iter()
                .filter(|(_, p)| p.due_at <= now)
                .map(|(c, _)| *c)
                .collect();
            categories
                .into_iter()
                .filter_map(|c| pending.remove(&c))
                .map(|p| p.record)
                .collect()
        };

        due.iter()
            .filter(|record| !self.superseded_in_store(record))
            .filter(|record| self.publish(record))
            .count()
    }

    /// Whether another peer persisted a newer value while this one sat queued
    fn superseded_in_store(&self, record: &StateRecord) -> bool {
        let key = self.config.storage_key(record.category);
        let stored = match self.store.get(&key) {
            Ok(Some(raw)) => serde_json::from_str::<StoredState>(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                None
            }
        };

        match stored {
            Some(stored) if stored.timestamp > record.timestamp => {
                debug!(
                    "Dropping queued {} @{}, store already holds @{}",
                    record.category, record.timestamp, stored.timestamp
                );
                true
            }
            _ => false,
        }
    }

    /// Publish `record` now with `wire_value` in place of its held value.
    /// Drops any broadcast still queued for the category.
    pub async fn broadcast_as(&self, record: &StateRecord, wire_value: serde_json::Value) -> bool {
        self.pending.write().await.remove(&record.category);
        self.publish_value(record, wire_value)
    }

    /// Earliest pending debounce deadline, if any
    pub async fn next_due(&self) -> Option<u64> {
        self.pending.read().await.values().map(|p| p.due_at).min()
    }

    /// Re-broadcast every held category now, dropping queued broadcasts
    pub async fn force_sync_all(&self) -> usize {
        self.pending.write().await.clear();
        let mut records: Vec<StateRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.category);

        let sent = records.iter().filter(|record| self.publish(record)).count();
        info!("Force-synced {} of {} categories", sent, records.len());
        sent
    }

    /// Adopt persisted categories that are newer than what is held
    pub async fn load_from_store(&self) -> usize {
        let mut loaded = 0;

        for category in StateCategory::ALL {
            let key = self.config.storage_key(category);
            let raw = match self.store.get(&key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read {}: {}", key, e);
                    continue;
                }
            };
            let stored: StoredState = match serde_json::from_str(&raw) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("Ignoring malformed stored state {}: {}", key, e);
                    continue;
                }
            };

            let record = {
                let mut records = self.records.write().await;
                if records
                    .get(&category)
                    .is_some_and(|current| stored.timestamp <= current.timestamp)
                {
                    continue;
                }
                let record = StateRecord {
                    category,
                    value: stored.state,
                    timestamp: stored.timestamp,
                    origin_peer: self.peer_id.clone(),
                };
                records.insert(category, record.clone());
                record
            };

            self.listeners
                .notify(category, &record.value, UpdateSource::StorageLoad);
            loaded += 1;
        }

        if loaded > 0 {
            info!("Loaded {} categories from store", loaded);
        }
        loaded
    }

    /// Drop every record, queued broadcast and persisted entry
    pub async fn clear_all(&self) {
        self.records.write().await.clear();
        self.pending.write().await.clear();

        match self.store.clear_prefix(&self.config.state_prefix()) {
            Ok(removed) => info!("Cleared state ({} persisted entries)", removed),
            Err(e) => warn!("{}", TabSyncError::PersistenceFailure(e.to_string())),
        }
    }

    pub async fn get_state(&self, category: StateCategory) -> Option<StateRecord> {
        self.records.read().await.get(&category).cloned()
    }

    pub async fn snapshot(&self) -> Vec<StateRecord> {
        let mut records: Vec<StateRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.category);
        records
    }

    pub async fn stats(&self) -> SyncStats {
        SyncStats {
            tracked_categories: self.records.read().await.len(),
            pending_broadcasts: self.pending.read().await.len(),
            local_updates: self.counters.local_updates.load(Ordering::Relaxed),
            remote_applied: self.counters.remote_applied.load(Ordering::Relaxed),
            stale_rejected: self.counters.stale_rejected.load(Ordering::Relaxed),
            broadcasts_sent: self.counters.broadcasts_sent.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }

    fn publish(&self, record: &StateRecord) -> bool {
        self.publish_value(record, record.value.clone())
    }

    fn publish_value(&self, record: &StateRecord, state: serde_json::Value) -> bool {
        let channel_name = record.category.channel();
        let Some(channel) = self.channels.get(&channel_name) else {
            return false;
        };

        let payload = StateSyncPayload {
            category: record.category,
            state,
            timestamp: record.timestamp,
        };
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {} update: {}", record.category, e);
                return false;
            }
        };

        match channel.publish_at(STATE_SYNC_MESSAGE, data, record.timestamp) {
            Ok(delivery) => {
                self.counters.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Broadcast {} @{} on {} ({:?})",
                    record.category, record.timestamp, channel_name, delivery
                );
                true
            }
            Err(e) => {
                warn!("Broadcast of {} failed: {}", record.category, e);
                false
            }
        }
    }

    /// Best effort: a failed write leaves the in-memory record authoritative
    fn persist(&self, record: &StateRecord) -> bool {
        let stored = StoredState {
            state: record.value.clone(),
            timestamp: record.timestamp,
            last_updated: Utc::now().to_rfc3339(),
        };
        let key = self.config.storage_key(record.category);

        let result = serde_json::to_string(&stored)
            .map_err(TabSyncError::from)
            .and_then(|raw| self.store.set(&key, &raw).map_err(TabSyncError::from));

        match result {
            Ok(()) => true,
            Err(e) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!("{}", TabSyncError::PersistenceFailure(format!("{}: {}", key, e)));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::transport::{BroadcastHub, DEFAULT_RELAY_PREFIX};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        sync: StateSynchronizer,
        observer: Transport,
    }

    fn fixture() -> Fixture {
        let hub = BroadcastHub::default();
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(MemoryStore::new());
        let transport = Transport::connect(
            PeerId::from("peer_a"),
            Some(hub.clone()),
            store.clone(),
            DEFAULT_RELAY_PREFIX,
            clock.clone(),
        );
        let observer = Transport::connect(
            PeerId::from("peer_b"),
            Some(hub),
            store.clone(),
            DEFAULT_RELAY_PREFIX,
            clock.clone(),
        );
        let sync = StateSynchronizer::new(&transport, store.clone(), clock.clone(), SyncConfig::default());
        Fixture {
            clock,
            store,
            sync,
            observer,
        }
    }

    fn remote(category: StateCategory, state: serde_json::Value, timestamp: u64) -> Envelope {
        Envelope {
            kind: STATE_SYNC_MESSAGE.to_string(),
            data: json!({"category": category, "state": state, "timestamp": timestamp}),
            timestamp,
            origin: PeerId::from("peer_remote"),
        }
    }

    #[tokio::test]
    async fn test_debounce_coalesces_to_last_value() {
        let f = fixture();
        let mut rx = f.observer.open_channel(ChannelName::Balance).subscribe();

        for usd in [1, 2, 3] {
            f.sync
                .sync_state(StateCategory::Balance, json!({"usd": usd}), SyncOptions::default())
                .await
                .unwrap();
            f.clock.advance(100);
        }
        assert_eq!(f.sync.flush_due().await, 0);
        assert!(rx.try_recv().is_none());

        f.clock.advance(1_000);
        assert_eq!(f.sync.flush_due().await, 1);

        let msg = rx.try_recv().expect("one broadcast");
        assert_eq!(msg.data["state"], json!({"usd": 3}));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_immediate_publishes_synchronously() {
        let f = fixture();
        let mut rx = f.observer.open_channel(ChannelName::Config).subscribe();

        f.sync
            .sync_state(StateCategory::UserPreferences, json!({"theme": "dark"}), SyncOptions::immediate())
            .await
            .unwrap();

        let msg = rx.try_recv().expect("broadcast");
        assert_eq!(msg.kind, STATE_SYNC_MESSAGE);
        assert_eq!(msg.data["category"], "user_preferences");
        assert_eq!(f.sync.stats().await.pending_broadcasts, 0);
    }

    #[tokio::test]
    async fn test_stale_remote_is_dropped_without_notifying() {
        let f = fixture();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let _handle = f.sync.add_state_listener(StateCategory::Portfolio, move |v, source, _| {
            sink.lock().unwrap().push((v.clone(), source));
        });

        assert!(f.sync.handle_remote(&remote(StateCategory::Portfolio, json!(1), 500)).await.unwrap());
        assert!(!f.sync.handle_remote(&remote(StateCategory::Portfolio, json!(2), 500)).await.unwrap());
        assert!(!f.sync.handle_remote(&remote(StateCategory::Portfolio, json!(3), 400)).await.unwrap());

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (json!(1), UpdateSource::RemoteUpdate));
        assert_eq!(f.sync.get_state(StateCategory::Portfolio).await.unwrap().value, json!(1));
    }

    #[tokio::test]
    async fn test_local_timestamp_stays_ahead_of_adopted_remote() {
        let f = fixture();
        f.sync
            .handle_remote(&remote(StateCategory::Alerts, json!([]), 5_000))
            .await
            .unwrap();

        let record = f
            .sync
            .sync_state(StateCategory::Alerts, json!(["a"]), SyncOptions::local_only())
            .await
            .unwrap();
        assert_eq!(record.timestamp, 5_001);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let f = fixture();
        f.sync
            .sync_state(StateCategory::Watchlist, json!({"symbols": ["ETH"]}), SyncOptions::local_only())
            .await
            .unwrap();

        let raw = f.store.get("tabsync:state:watchlist").unwrap().unwrap();
        let stored: StoredState = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.timestamp, 1_000);

        f.sync.records.write().await.clear();
        assert_eq!(f.sync.load_from_store().await, 1);
        assert_eq!(
            f.sync.get_state(StateCategory::Watchlist).await.unwrap().value,
            json!({"symbols": ["ETH"]})
        );
    }

    #[tokio::test]
    async fn test_clear_all_removes_records_and_store_entries() {
        let f = fixture();
        f.sync
            .sync_state(StateCategory::UiState, json!({"tab": 2}), SyncOptions::default())
            .await
            .unwrap();

        f.sync.clear_all().await;

        assert!(f.sync.get_state(StateCategory::UiState).await.is_none());
        assert!(f.store.keys("tabsync:state:").unwrap().is_empty());
        assert_eq!(f.sync.next_due().await, None);
    }

    #[tokio::test]
    async fn test_queued_broadcast_yields_to_newer_stored_value() {
        let f = fixture();
        let mut rx = f.observer.open_channel(ChannelName::Balance).subscribe();
        f.sync
            .sync_state(StateCategory::Balance, json!({"usd": 1}), SyncOptions::default())
            .await
            .unwrap();

        let newer = StoredState {
            state: json!({"usd": 2}),
            timestamp: 1_200,
            last_updated: Utc::now().to_rfc3339(),
        };
        f.store
            .set("tabsync:state:balance", &serde_json::to_string(&newer).unwrap())
            .unwrap();

        f.clock.advance(1_000);
        assert_eq!(f.sync.flush_due().await, 0);
        assert!(rx.try_recv().is_none());
        assert_eq!(f.sync.stats().await.pending_broadcasts, 0);
    }

    #[tokio::test]
    async fn test_force_sync_bypasses_debounce() {
        let f = fixture();
        let mut rx = f.observer.open_channel(ChannelName::DataSync).subscribe();
        f.sync
            .sync_state(StateCategory::Watchlist, json!({"symbols": []}), SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(f.sync.force_sync_all().await, 1);
        assert!(rx.try_recv().is_some());
        assert_eq!(f.sync.flush_due().await, 0);
    }
}
