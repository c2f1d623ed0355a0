//! Channel publish/subscribe over the native hub or the storage relay

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BroadcastHub, ChannelName, Delivery, Envelope, PeerId};
use crate::clock::Clock;
use crate::error::{TabSyncError, TransportError};
use crate::store::{KeyValueStore, StoreEvent};

/// Default key prefix for relayed messages in the shared store
pub const DEFAULT_RELAY_PREFIX: &str = "tabsync:bus:";

#[derive(Clone)]
enum Backend {
    Native(BroadcastHub),
    Relay {
        store: Arc<dyn KeyValueStore>,
        prefix: String,
    },
}

/// Opens channels for one peer
pub struct Transport {
    peer_id: PeerId,
    backend: Backend,
    clock: Arc<dyn Clock>,
}

impl Transport {
    /// Connect using the native hub when present, otherwise degrade to the
    /// storage relay. Degrading is logged, never surfaced.
    pub fn connect(
        peer_id: PeerId,
        hub: Option<BroadcastHub>,
        store: Arc<dyn KeyValueStore>,
        relay_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backend = match hub {
            Some(hub) => Backend::Native(hub),
            None => {
                warn!(
                    "{}; peer {} falling back to storage relay",
                    TabSyncError::TransportUnavailable("no broadcast hub".to_string()),
                    peer_id
                );
                Backend::Relay {
                    store,
                    prefix: relay_prefix.to_string(),
                }
            }
        };

        Self {
            peer_id,
            backend,
            clock,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// True when publications go through the storage relay
    pub fn is_degraded(&self) -> bool {
        matches!(self.backend, Backend::Relay { .. })
    }

    pub fn open_channel(&self, name: ChannelName) -> Channel {
        let backend = match &self.backend {
            Backend::Native(hub) => ChannelBackend::Native(hub.sender(name.as_str())),
            Backend::Relay { store, prefix } => ChannelBackend::Relay {
                store: store.clone(),
                key_prefix: format!("{}{}:", prefix, name.as_str()),
            },
        };

        Channel {
            name,
            peer_id: self.peer_id.clone(),
            clock: self.clock.clone(),
            backend,
        }
    }
}

#[derive(Clone)]
enum ChannelBackend {
    Native(broadcast::Sender<Envelope>),
    Relay {
        store: Arc<dyn KeyValueStore>,
        key_prefix: String,
    },
}

/// One named channel as seen by one peer. Stays open for the peer's lifetime.
#[derive(Clone)]
pub struct Channel {
    name: ChannelName,
    peer_id: PeerId,
    clock: Arc<dyn Clock>,
    backend: ChannelBackend,
}

impl Channel {
    pub fn name(&self) -> ChannelName {
        self.name
    }

    /// Publish stamped with the current time
    pub fn publish(&self, kind: &str, data: serde_json::Value) -> Result<Delivery, TransportError> {
        self.publish_at(kind, data, self.clock.now_ms())
    }

    /// Publish with an explicit envelope timestamp
    pub fn publish_at(
        &self,
        kind: &str,
        data: serde_json::Value,
        timestamp: u64,
    ) -> Result<Delivery, TransportError> {
        let envelope = Envelope {
            kind: kind.to_string(),
            data,
            timestamp,
            origin: self.peer_id.clone(),
        };

        match &self.backend {
            ChannelBackend::Native(tx) => {
                // Err only means nobody is listening yet
                let receivers = tx.send(envelope).unwrap_or(0);
                debug!("{} -> {} ({} receivers)", kind, self.name, receivers);
                Ok(Delivery::Direct)
            }
            ChannelBackend::Relay { store, key_prefix } => {
                let json = serde_json::to_string(&envelope)?;
                let key = format!("{}{}", key_prefix, Uuid::new_v4().simple());
                store.set(&key, &json)?;
                store.remove(&key)?;
                debug!("{} -> {} (relayed)", kind, self.name);
                Ok(Delivery::Relayed)
            }
        }
    }

    pub fn subscribe(&self) -> ChannelReceiver {
        let source = match &self.backend {
            ChannelBackend::Native(tx) => ReceiverSource::Native(tx.subscribe()),
            ChannelBackend::Relay { store, key_prefix } => ReceiverSource::Relay {
                rx: store.watch(),
                key_prefix: key_prefix.clone(),
            },
        };

        ChannelReceiver {
            name: self.name,
            peer_id: self.peer_id.clone(),
            source,
        }
    }

    /// Run `handler` for every message from other peers until unsubscribed.
    /// Must be called inside a tokio runtime.
    pub fn subscribe_with<F>(&self, handler: F) -> Subscription
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                handler(envelope);
            }
        });

        Subscription {
            channel: self.name,
            handle,
        }
    }
}

enum ReceiverSource {
    Native(broadcast::Receiver<Envelope>),
    Relay {
        rx: broadcast::Receiver<StoreEvent>,
        key_prefix: String,
    },
}

/// Receiving side of a channel; drops this peer's own publications
pub struct ChannelReceiver {
    name: ChannelName,
    peer_id: PeerId,
    source: ReceiverSource,
}

impl ChannelReceiver {
    pub fn name(&self) -> ChannelName {
        self.name
    }

    /// Next message from another peer, `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let candidate = match &mut self.source {
                ReceiverSource::Native(rx) => match rx.recv().await {
                    Ok(envelope) => Some(envelope),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Channel {} lagged, {} messages dropped", self.name, n);
                        None
                    }
                    Err(RecvError::Closed) => return None,
                },
                ReceiverSource::Relay { rx, key_prefix } => match rx.recv().await {
                    Ok(event) => decode_relayed(key_prefix, event),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Relay for {} lagged, {} events dropped", self.name, n);
                        None
                    }
                    Err(RecvError::Closed) => return None,
                },
            };

            if let Some(envelope) = candidate {
                if envelope.origin != self.peer_id {
                    return Some(envelope);
                }
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            let candidate = match &mut self.source {
                ReceiverSource::Native(rx) => match rx.try_recv() {
                    Ok(envelope) => Some(envelope),
                    Err(TryRecvError::Lagged(n)) => {
                        warn!("Channel {} lagged, {} messages dropped", self.name, n);
                        None
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
                },
                ReceiverSource::Relay { rx, key_prefix } => match rx.try_recv() {
                    Ok(event) => decode_relayed(key_prefix, event),
                    Err(TryRecvError::Lagged(n)) => {
                        warn!("Relay for {} lagged, {} events dropped", self.name, n);
                        None
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
                },
            };

            if let Some(envelope) = candidate {
                if envelope.origin != self.peer_id {
                    return Some(envelope);
                }
            }
        }
    }
}

/// Relay writes arrive as store changes; removals and foreign keys are ignored
fn decode_relayed(key_prefix: &str, event: StoreEvent) -> Option<Envelope> {
    if !event.key.starts_with(key_prefix) {
        return None;
    }
    let value = event.value?;
    match serde_json::from_str(&value) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!("Dropping undecodable relay entry {}: {}", event.key, e);
            None
        }
    }
}

/// Handle for a handler-based subscription. Release it explicitly.
pub struct Subscription {
    channel: ChannelName,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn channel(&self) -> ChannelName {
        self.channel
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn unsubscribe(self) {
        debug!("Unsubscribing handler from {}", self.channel);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pair(hub: Option<BroadcastHub>) -> (Transport, Transport, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let a = Transport::connect(
            PeerId::from("a"),
            hub.clone(),
            store.clone(),
            DEFAULT_RELAY_PREFIX,
            clock.clone(),
        );
        let b = Transport::connect(
            PeerId::from("b"),
            hub,
            store.clone(),
            DEFAULT_RELAY_PREFIX,
            clock,
        );
        (a, b, store)
    }

    #[test]
    fn test_native_delivery_skips_own_messages() {
        let (a, b, _) = pair(Some(BroadcastHub::default()));
        let a_ch = a.open_channel(ChannelName::Balance);
        let b_ch = b.open_channel(ChannelName::Balance);
        let mut a_rx = a_ch.subscribe();
        let mut b_rx = b_ch.subscribe();

        assert_eq!(
            a_ch.publish("ping", json!({"n": 1})).unwrap(),
            Delivery::Direct
        );

        let got = b_rx.try_recv().unwrap();
        assert_eq!(got.kind, "ping");
        assert_eq!(got.origin, PeerId::from("a"));
        assert_eq!(got.timestamp, 1_000);
        assert!(a_rx.try_recv().is_none());
    }

    #[test]
    fn test_relay_fallback_delivers_and_cleans_up() {
        let (a, b, store) = pair(None);
        assert!(a.is_degraded());

        let a_ch = a.open_channel(ChannelName::Trade);
        let mut b_rx = b.open_channel(ChannelName::Trade).subscribe();
        let mut other_rx = b.open_channel(ChannelName::Balance).subscribe();

        assert_eq!(
            a_ch.publish("ping", json!({})).unwrap(),
            Delivery::Relayed
        );

        let got = b_rx.try_recv().unwrap();
        assert_eq!(got.kind, "ping");
        assert!(b_rx.try_recv().is_none());
        assert!(other_rx.try_recv().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_relay_quota_failure_is_reported() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let t = Transport::connect(
            PeerId::from("a"),
            None,
            store,
            DEFAULT_RELAY_PREFIX,
            Arc::new(ManualClock::new(0)),
        );
        let err = t
            .open_channel(ChannelName::Session)
            .publish("big", json!({"payload": "x".repeat(64)}))
            .unwrap_err();
        assert!(matches!(err, TransportError::Relay(_)));
    }

    #[tokio::test]
    async fn test_subscribe_with_handler_and_unsubscribe() {
        let (a, b, _) = pair(Some(BroadcastHub::default()));
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();

        let sub = b
            .open_channel(ChannelName::Session)
            .subscribe_with(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert!(sub.is_active());

        let a_ch = a.open_channel(ChannelName::Session);
        a_ch.publish("hello", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_millis(5)).await;
        a_ch.publish("hello", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
