pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod error;
pub mod peer;
pub mod store;
pub mod sync;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use coordination::{
    Action, ActionCoordinator, ActionId, ActionStatus, ActionType, ConfirmationNotifier,
    ConflictId, ConflictRecord, Registration, Resolution, ResolutionStrategy, UserChoice,
};
pub use error::{Result, StoreError, TabSyncError, TransportError};
pub use peer::{AuthProvider, PeerDeps, PeerRuntime, PeerState, StaticAuth};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{StateCategory, StateRecord, StateSynchronizer, SyncOptions, UpdateSource};
pub use transport::{BroadcastHub, ChannelName, Envelope, PeerId, Transport};
