//! Replicated per-category state
//!
//! - `category`: state categories, records, sync options
//! - `listeners`: callback registry with removable handles
//! - `synchronizer`: debounced replication with a staleness guard

pub mod category;
pub mod config;
pub mod listeners;
pub mod synchronizer;

pub use category::{StateCategory, StateRecord, StoredState, SyncOptions, UpdateSource};
pub use config::SyncConfig;
pub use listeners::{ListenerHandle, StateListener};
pub use synchronizer::{StateSyncPayload, StateSynchronizer, SyncStats, STATE_SYNC_MESSAGE};
