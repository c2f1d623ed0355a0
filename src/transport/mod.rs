//! Broadcast Transport
//!
//! Named-channel publish/subscribe between peers of the same user:
//! - Native delivery through a process-wide [`BroadcastHub`]
//! - Storage-relay fallback through the shared [`KeyValueStore`](crate::store::KeyValueStore)
//!   change feed when no hub is available
//! - Self-filtering: a peer never receives its own publications

pub mod channel;
pub mod hub;
pub mod inbox;

pub use channel::{Channel, ChannelReceiver, Subscription, Transport, DEFAULT_RELAY_PREFIX};
pub use hub::BroadcastHub;
pub use inbox::Inbox;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one execution context, generated once at startup
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn generate() -> Self {
        Self(format!("peer_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical channel names, stable across every peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelName {
    Session,
    AuthState,
    Balance,
    Trade,
    Notifications,
    Config,
    Portfolio,
    MarketData,
    DataSync,
    ConflictDetected,
    ConflictResolution,
    SessionActionStart,
    SessionActionComplete,
    ActionLockRequest,
    ActionLockRelease,
}

impl ChannelName {
    pub const ALL: [ChannelName; 15] = [
        ChannelName::Session,
        ChannelName::AuthState,
        ChannelName::Balance,
        ChannelName::Trade,
        ChannelName::Notifications,
        ChannelName::Config,
        ChannelName::Portfolio,
        ChannelName::MarketData,
        ChannelName::DataSync,
        ChannelName::ConflictDetected,
        ChannelName::ConflictResolution,
        ChannelName::SessionActionStart,
        ChannelName::SessionActionComplete,
        ChannelName::ActionLockRequest,
        ChannelName::ActionLockRelease,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Session => "session",
            ChannelName::AuthState => "auth-state",
            ChannelName::Balance => "balance",
            ChannelName::Trade => "trade",
            ChannelName::Notifications => "notifications",
            ChannelName::Config => "config",
            ChannelName::Portfolio => "portfolio",
            ChannelName::MarketData => "market-data",
            ChannelName::DataSync => "data-sync",
            ChannelName::ConflictDetected => "conflict_detected",
            ChannelName::ConflictResolution => "conflict_resolution",
            ChannelName::SessionActionStart => "session_action_start",
            ChannelName::SessionActionComplete => "session_action_complete",
            ChannelName::ActionLockRequest => "action_lock_request",
            ChannelName::ActionLockRelease => "action_lock_release",
        }
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelName::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown channel: {}", s))
    }
}

/// Wire envelope: `{type, data, timestamp, origin}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: u64,
    pub origin: PeerId,
}

/// How a publication left this peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent over the native broadcast primitive
    Direct,
    /// Written through the storage relay (higher latency, may be lost across reloads)
    Relayed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names_roundtrip() {
        for name in ChannelName::ALL {
            assert_eq!(name.as_str().parse::<ChannelName>().unwrap(), name);
        }
        assert!("nope".parse::<ChannelName>().is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope {
            kind: "state_sync".into(),
            data: serde_json::json!({"category": "balance"}),
            timestamp: 42,
            origin: PeerId::from("peer_a"),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "state_sync");
        assert_eq!(json["origin"], "peer_a");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn test_generated_peer_ids_are_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }
}
