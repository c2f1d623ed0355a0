//! Replicated state categories and their records

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::coordination::ActionType;
use crate::error::TabSyncError;
use crate::transport::{ChannelName, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateCategory {
    Balance,
    Portfolio,
    TradingSettings,
    UiState,
    Notifications,
    Watchlist,
    Alerts,
    UserPreferences,
}

impl StateCategory {
    pub const ALL: [StateCategory; 8] = [
        StateCategory::Balance,
        StateCategory::Portfolio,
        StateCategory::TradingSettings,
        StateCategory::UiState,
        StateCategory::Notifications,
        StateCategory::Watchlist,
        StateCategory::Alerts,
        StateCategory::UserPreferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateCategory::Balance => "balance",
            StateCategory::Portfolio => "portfolio",
            StateCategory::TradingSettings => "trading_settings",
            StateCategory::UiState => "ui_state",
            StateCategory::Notifications => "notifications",
            StateCategory::Watchlist => "watchlist",
            StateCategory::Alerts => "alerts",
            StateCategory::UserPreferences => "user_preferences",
        }
    }

    /// Static debounce interval, by volatility and cost
    pub fn default_debounce_ms(&self) -> u64 {
        match self {
            StateCategory::Balance => 1_000,
            StateCategory::Portfolio => 2_000,
            StateCategory::TradingSettings => 10_000,
            StateCategory::UiState => 500,
            StateCategory::Notifications => 250,
            StateCategory::Watchlist => 3_000,
            StateCategory::Alerts => 2_000,
            StateCategory::UserPreferences => 5_000,
        }
    }

    /// Channel this category's updates travel on
    pub fn channel(&self) -> ChannelName {
        match self {
            StateCategory::Balance => ChannelName::Balance,
            StateCategory::Portfolio => ChannelName::Portfolio,
            StateCategory::Notifications => ChannelName::Notifications,
            StateCategory::TradingSettings | StateCategory::UserPreferences => ChannelName::Config,
            StateCategory::UiState | StateCategory::Watchlist | StateCategory::Alerts => {
                ChannelName::DataSync
            }
        }
    }

    /// Distinct channels used by all categories
    pub fn channels() -> Vec<ChannelName> {
        let mut channels: Vec<ChannelName> = Vec::new();
        for category in StateCategory::ALL {
            let channel = category.channel();
            if !channels.contains(&channel) {
                channels.push(channel);
            }
        }
        channels
    }
}

impl std::fmt::Display for StateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StateCategory {
    type Err = TabSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| TabSyncError::InvalidState(format!("unknown state category: {}", s)))
    }
}

/// The locally believed latest value of one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub category: StateCategory,
    pub value: serde_json::Value,
    pub timestamp: u64,
    pub origin_peer: PeerId,
}

/// Persisted form: `{state, timestamp, lastUpdated}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredState {
    pub state: serde_json::Value,
    pub timestamp: u64,
    pub last_updated: String,
}

/// Provenance of an accepted update, handed to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    LocalUpdate,
    RemoteUpdate,
    StorageLoad,
    /// Result of a completed coordinated action, e.g. `balance_update`
    ActionResult(ActionType),
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::LocalUpdate => "local_update",
            UpdateSource::RemoteUpdate => "remote_update",
            UpdateSource::StorageLoad => "storage_load",
            UpdateSource::ActionResult(t) => t.as_str(),
        }
    }
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-call options for `sync_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Override of the category's debounce interval
    pub debounce_ms: Option<u64>,
    /// Publish now instead of after the debounce interval
    pub immediate: bool,
    pub broadcast: bool,
    pub persist: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce_ms: None,
            immediate: false,
            broadcast: true,
            persist: true,
        }
    }
}

impl SyncOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Default::default()
        }
    }

    /// Update this peer only: no broadcast
    pub fn local_only() -> Self {
        Self {
            broadcast: false,
            ..Default::default()
        }
    }

    pub fn with_debounce(mut self, ms: u64) -> Self {
        self.debounce_ms = Some(ms);
        self
    }

    pub fn without_persist(mut self) -> Self {
        self.persist = false;
        self
    }
}
