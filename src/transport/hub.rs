use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::Envelope;

/// Default per-channel buffer before slow receivers start lagging
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Process-wide registry of named broadcast channels.
///
/// This is the native cross-context primitive: every peer holding a clone of
/// the same hub sees the same channels. Cloning is cheap.
#[derive(Clone)]
pub struct BroadcastHub {
    channels: Arc<DashMap<String, broadcast::Sender<Envelope>>>,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Get or create the sender for a channel
    pub fn sender(&self, name: &str) -> broadcast::Sender<Envelope> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Opening native channel {}", name);
                broadcast::channel(self.capacity).0
            })
            .clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_shares_sender() {
        let hub = BroadcastHub::default();
        let a = hub.sender("balance");
        let b = hub.clone().sender("balance");
        assert!(a.same_channel(&b));
        assert_eq!(hub.channel_count(), 1);
    }
}
