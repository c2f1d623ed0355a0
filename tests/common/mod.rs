#![allow(dead_code)]

use std::sync::Arc;
use tabsync::config::AppConfig;
use tabsync::peer::{PeerDeps, PeerRuntime, StaticAuth};
use tabsync::store::{KeyValueStore, MemoryStore};
use tabsync::transport::{BroadcastHub, PeerId};
use tabsync::ManualClock;

/// Several peers of one user sharing a hub, a store and a virtual clock
pub struct Cluster {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn KeyValueStore>,
    pub hub: BroadcastHub,
    pub peers: Vec<PeerRuntime>,
}

impl Cluster {
    pub fn new(names: &[&str], start_ms: u64) -> Self {
        Self::build(names, start_ms, true, Arc::new(MemoryStore::new()))
    }

    pub fn relayed(names: &[&str], start_ms: u64) -> Self {
        Self::build(names, start_ms, false, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(names: &[&str], start_ms: u64, store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(names, start_ms, true, store)
    }

    fn build(names: &[&str], start_ms: u64, native: bool, store: Arc<dyn KeyValueStore>) -> Self {
        let clock = Arc::new(ManualClock::new(start_ms));
        let hub = BroadcastHub::default();
        let mut config = AppConfig::default();
        config.transport.native = native;

        let peers = names
            .iter()
            .map(|name| {
                let deps = PeerDeps::new(
                    Some(hub.clone()),
                    store.clone(),
                    Arc::new(StaticAuth::signed_in("alice")),
                )
                .with_clock(clock.clone());
                PeerRuntime::new(PeerId::from(*name), deps, &config)
            })
            .collect();

        Self {
            clock,
            store,
            hub,
            peers,
        }
    }

    pub fn peer(&self, i: usize) -> &PeerRuntime {
        &self.peers[i]
    }

    /// Dispatch queued messages on every peer until nothing is left in flight
    pub async fn settle(&self) -> usize {
        let mut total = 0;
        for _ in 0..32 {
            let mut round = 0;
            for peer in &self.peers {
                round += peer.pump().await;
            }
            if round == 0 {
                return total;
            }
            total += round;
        }
        panic!("cluster did not settle after {} messages", total);
    }
}
