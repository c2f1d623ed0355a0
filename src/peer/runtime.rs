//! Peer Runtime
//!
//! One execution context: a transport, an action coordinator and a state
//! synchronizer sharing a single event loop. Lifecycle follows the user's
//! session: state is loaded on sign-in and wiped on sign-out, on this peer
//! and, through the `auth-state` channel, on every other peer of the user.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::auth::AuthProvider;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::coordination::{ActionCoordinator, ConfirmationNotifier, LogNotifier};
use crate::error::{Result, TabSyncError};
use crate::store::KeyValueStore;
use crate::sync::StateSynchronizer;
use crate::transport::{BroadcastHub, Channel, ChannelName, Envelope, Inbox, PeerId, Transport};

/// Published on `auth-state` when the user signs out anywhere
pub const SIGNED_OUT: &str = "signed_out";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Constructed; channels subscribed, no tasks running
    Created,
    /// Event loop and timers running, session active
    Running,
    /// Event loop running, state cleared after sign-out
    SignedOut,
    /// Tasks aborted; terminal
    Disposed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disposed)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerState::Created => write!(f, "created"),
            PeerState::Running => write!(f, "running"),
            PeerState::SignedOut => write!(f, "signed_out"),
            PeerState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Lifecycle events broadcast to listeners
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged { from: PeerState, to: PeerState },
    StateLoaded { categories: usize },
    /// `remote` is true when another peer initiated the sign-out
    SignedOut { remote: bool },
    Resumed { resynced: usize },
}

/// Collaborators and shared infrastructure for one peer
pub struct PeerDeps {
    /// Native broadcast primitive; `None` forces the storage relay
    pub hub: Option<BroadcastHub>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub auth: Arc<dyn AuthProvider>,
    pub notifier: Arc<dyn ConfirmationNotifier>,
}

impl PeerDeps {
    /// Wall clock and log-only notifications
    pub fn new(hub: Option<BroadcastHub>, store: Arc<dyn KeyValueStore>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            hub,
            store,
            clock: Arc::new(SystemClock),
            auth,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ConfirmationNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

struct PeerInner {
    peer_id: PeerId,
    degraded: bool,
    coordinator: Arc<ActionCoordinator>,
    synchronizer: Arc<StateSynchronizer>,
    auth: Arc<dyn AuthProvider>,
    auth_channel: Channel,
    /// Taken by the event loop on `init`; `pump` uses it until then
    inbox: Mutex<Option<Inbox>>,
    state: RwLock<PeerState>,
    event_tx: broadcast::Sender<PeerEvent>,
    sweep_interval_ms: u64,
    timer_resolution_ms: u64,
}

impl PeerInner {
    async fn set_state(&self, to: PeerState) {
        let mut state = self.state.write().await;
        let from = *state;
        if from == to || from.is_terminal() {
            return;
        }
        *state = to;
        debug!("Peer {} state: {} -> {}", self.peer_id, from, to);
        let _ = self.event_tx.send(PeerEvent::StateChanged { from, to });
    }

    async fn dispatch(&self, channel: ChannelName, envelope: Envelope) {
        let result = match channel {
            ChannelName::AuthState => {
                if envelope.kind == SIGNED_OUT {
                    info!("Peer {}: sign-out from {}", self.peer_id, envelope.origin);
                    self.clear_local().await;
                    self.set_state(PeerState::SignedOut).await;
                    let _ = self.event_tx.send(PeerEvent::SignedOut { remote: true });
                }
                Ok(())
            }
            ChannelName::SessionActionStart
            | ChannelName::SessionActionComplete
            | ChannelName::ConflictDetected
            | ChannelName::ConflictResolution => {
                self.coordinator.handle_message(channel, &envelope).await
            }
            _ => self.synchronizer.handle_remote(&envelope).await.map(|_| ()),
        };

        if let Err(e) = result {
            warn!(
                "Peer {}: dropping {} on {} from {}: {}",
                self.peer_id, envelope.kind, channel, envelope.origin, e
            );
        }
    }

    async fn load_state(&self) -> usize {
        let categories = self.synchronizer.load_from_store().await;
        let _ = self.event_tx.send(PeerEvent::StateLoaded { categories });
        categories
    }

    async fn clear_local(&self) {
        self.coordinator.clear().await;
        self.synchronizer.clear_all().await;
    }
}

pub struct PeerRuntime {
    inner: Arc<PeerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerRuntime {
    /// Build the peer and subscribe every channel it consumes, so nothing
    /// published before `init` is missed.
    pub fn new(peer_id: PeerId, deps: PeerDeps, config: &AppConfig) -> Self {
        let hub = if config.transport.native { deps.hub } else { None };
        let transport = Transport::connect(
            peer_id.clone(),
            hub,
            deps.store.clone(),
            &config.transport.relay_prefix,
            deps.clock.clone(),
        );

        let synchronizer = Arc::new(StateSynchronizer::new(
            &transport,
            deps.store,
            deps.clock.clone(),
            config.sync.clone(),
        ));
        let coordinator = Arc::new(ActionCoordinator::new(
            &transport,
            deps.clock,
            deps.notifier,
            Some(synchronizer.clone()),
            config.coordinator.clone(),
        ));
        let auth_channel = transport.open_channel(ChannelName::AuthState);

        let mut inbox = Inbox::new();
        for channel in coordinator
            .channels()
            .iter()
            .chain(synchronizer.channels().iter())
            .chain(std::iter::once(&auth_channel))
        {
            inbox.attach(channel);
        }

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        info!(
            "Peer {} created ({} transport, {} channels)",
            peer_id,
            if transport.is_degraded() { "relay" } else { "native" },
            inbox.channels().len()
        );

        Self {
            inner: Arc::new(PeerInner {
                peer_id,
                degraded: transport.is_degraded(),
                coordinator,
                synchronizer,
                auth: deps.auth,
                auth_channel,
                inbox: Mutex::new(Some(inbox)),
                state: RwLock::new(PeerState::Created),
                event_tx,
                sweep_interval_ms: config.coordinator.sweep_interval_ms.max(1),
                timer_resolution_ms: config.sync.timer_resolution_ms.max(1),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    pub fn coordinator(&self) -> &Arc<ActionCoordinator> {
        &self.inner.coordinator
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.inner.synchronizer
    }

    /// True when messages go through the storage relay
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded
    }

    pub async fn state(&self) -> PeerState {
        *self.inner.state.read().await
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Start the event loop, the debounce flush timer and the sweep timer.
    /// Loads persisted state when the session is valid.
    pub async fn init(&self) -> Result<()> {
        let current = self.state().await;
        match current {
            PeerState::Created => {}
            PeerState::Disposed => {
                return Err(TabSyncError::InvalidState(format!(
                    "peer {} is disposed",
                    self.inner.peer_id
                )))
            }
            _ => return Ok(()),
        }

        let Some(mut inbox) = self.inner.inbox.lock().await.take() else {
            return Err(TabSyncError::InvalidState("inbox already taken".to_string()));
        };

        let mut tasks = self.tasks.lock().await;

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((channel, envelope)) = inbox.next().await {
                inner.dispatch(channel, envelope).await;
            }
            debug!("Peer {} event loop finished", inner.peer_id);
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(inner.timer_resolution_ms));
            loop {
                ticker.tick().await;
                inner.synchronizer.flush_due().await;
            }
        }));

        let inner = self.inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(inner.sweep_interval_ms));
            loop {
                ticker.tick().await;
                let report = inner.coordinator.sweep().await;
                if !report.is_empty() {
                    debug!("Peer {} sweep: {:?}", inner.peer_id, report);
                }
            }
        }));
        drop(tasks);

        if self.inner.auth.is_session_valid().await {
            self.inner.load_state().await;
            self.inner.set_state(PeerState::Running).await;
        } else {
            self.inner.set_state(PeerState::SignedOut).await;
        }

        info!("Peer {} initialized", self.inner.peer_id);
        Ok(())
    }

    /// Load persisted state for the signed-in user
    pub async fn sign_in(&self) -> Result<usize> {
        self.ensure_alive().await?;
        let user = self.inner.auth.current_user().await;
        let loaded = self.inner.load_state().await;
        self.inner.set_state(PeerState::Running).await;
        info!(
            "Peer {} signed in as {} ({} categories loaded)",
            self.inner.peer_id,
            user.as_deref().unwrap_or("<unknown>"),
            loaded
        );
        Ok(loaded)
    }

    /// Clear every table and category here, then tell the other peers
    pub async fn sign_out(&self) -> Result<()> {
        self.ensure_alive().await?;
        self.inner.clear_local().await;

        if let Err(e) = self
            .inner
            .auth_channel
            .publish(SIGNED_OUT, serde_json::json!({ "peer": self.inner.peer_id }))
        {
            warn!("Failed to announce sign-out: {}", e);
        }

        self.inner.set_state(PeerState::SignedOut).await;
        let _ = self.inner.event_tx.send(PeerEvent::SignedOut { remote: false });
        info!("Peer {} signed out", self.inner.peer_id);
        Ok(())
    }

    /// Re-broadcast all held state after the context was suspended
    pub async fn resume(&self) -> Result<usize> {
        self.ensure_alive().await?;
        let resynced = self.inner.synchronizer.force_sync_all().await;
        let _ = self.inner.event_tx.send(PeerEvent::Resumed { resynced });
        Ok(resynced)
    }

    /// Dispatch everything already queued, without spawned tasks.
    /// Does nothing once `init` has handed the inbox to the event loop.
    pub async fn pump(&self) -> usize {
        let batch = {
            let mut guard = self.inner.inbox.lock().await;
            match guard.as_mut() {
                Some(inbox) => inbox.drain(),
                None => return 0,
            }
        };

        let count = batch.len();
        for (channel, envelope) in batch {
            self.inner.dispatch(channel, envelope).await;
        }
        count
    }

    /// Abort the event loop and timers
    pub async fn dispose(&self) {
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.inner.set_state(PeerState::Disposed).await;
        info!("Peer {} disposed", self.inner.peer_id);
    }

    async fn ensure_alive(&self) -> Result<()> {
        if self.state().await.is_terminal() {
            return Err(TabSyncError::InvalidState(format!(
                "peer {} is disposed",
                self.inner.peer_id
            )));
        }
        Ok(())
    }
}

impl Drop for PeerRuntime {
    fn drop(&mut self) {
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}
