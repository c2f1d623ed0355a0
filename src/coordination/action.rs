//! Actions: registered intents to perform a state-changing operation

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::error::TabSyncError;
use crate::transport::PeerId;

/// Every action type the coordinator knows how to arbitrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    TradeExecution,
    OrderCancellation,
    BalanceUpdate,
    WithdrawalRequest,
    PortfolioModification,
    SettingsUpdate,
    WatchlistUpdate,
    AlertManagement,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::TradeExecution,
        ActionType::OrderCancellation,
        ActionType::BalanceUpdate,
        ActionType::WithdrawalRequest,
        ActionType::PortfolioModification,
        ActionType::SettingsUpdate,
        ActionType::WatchlistUpdate,
        ActionType::AlertManagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::TradeExecution => "trade_execution",
            ActionType::OrderCancellation => "order_cancellation",
            ActionType::BalanceUpdate => "balance_update",
            ActionType::WithdrawalRequest => "withdrawal_request",
            ActionType::PortfolioModification => "portfolio_modification",
            ActionType::SettingsUpdate => "settings_update",
            ActionType::WatchlistUpdate => "watchlist_update",
            ActionType::AlertManagement => "alert_management",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = TabSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TabSyncError::UnknownActionType(s.to_string()))
    }
}

/// Deterministic action identifier derived from `(type, payload, createdAt)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn derive(action_type: ActionType, payload: &serde_json::Value, created_at: u64) -> Self {
        // serde_json maps are ordered by key, so this encoding is canonical
        let mut hasher = Sha256::new();
        hasher.update(action_type.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(payload.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(created_at.to_be_bytes());
        let digest = hasher.finalize();
        Self(format!("{}_{}", action_type.as_str(), hex::encode(&digest[..12])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
    /// Lost a conflict resolution
    Rejected,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionStatus::Pending => write!(f, "pending"),
            ActionStatus::Completed => write!(f, "completed"),
            ActionStatus::Failed => write!(f, "failed"),
            ActionStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// An in-flight intent owned by the coordinator's pending table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub origin_peer: PeerId,
    pub created_at: u64,
    pub status: ActionStatus,
}

impl Action {
    pub fn new(
        action_type: ActionType,
        payload: serde_json::Value,
        origin_peer: PeerId,
        created_at: u64,
    ) -> Self {
        Self {
            id: ActionId::derive(action_type, &payload, created_at),
            action_type,
            payload,
            origin_peer,
            created_at,
            status: ActionStatus::Pending,
        }
    }

    /// String field of the payload, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(|v| v.as_str())
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}
