//! Static resolution policy table and pairwise conflict predicates.
//!
//! This table is the single source of truth for how each action type behaves
//! under contention. Matches are exhaustive so adding an [`ActionType`]
//! forces a decision here.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::action::{Action, ActionType};
use crate::error::TabSyncError;
use crate::sync::StateCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    FirstWins,
    LastWins,
    Merge,
    UserChoice,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::FirstWins => write!(f, "first_wins"),
            ResolutionStrategy::LastWins => write!(f, "last_wins"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::UserChoice => write!(f, "user_choice"),
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = TabSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_wins" => Ok(ResolutionStrategy::FirstWins),
            "last_wins" => Ok(ResolutionStrategy::LastWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "user_choice" => Ok(ResolutionStrategy::UserChoice),
            other => Err(TabSyncError::InvalidState(format!(
                "unknown resolution strategy: {}",
                other
            ))),
        }
    }
}

/// Lower value = more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl std::fmt::Display for ActionPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionPriority::Critical => write!(f, "critical"),
            ActionPriority::High => write!(f, "high"),
            ActionPriority::Normal => write!(f, "normal"),
            ActionPriority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPolicy {
    pub strategy: ResolutionStrategy,
    pub requires_confirmation: bool,
    pub priority: ActionPriority,
    /// Maximum lifetime of a pending action or unresolved conflict of this type
    pub timeout_ms: u64,
}

impl ResolutionPolicy {
    const fn new(
        strategy: ResolutionStrategy,
        requires_confirmation: bool,
        priority: ActionPriority,
        timeout_ms: u64,
    ) -> Self {
        Self {
            strategy,
            requires_confirmation,
            priority,
            timeout_ms,
        }
    }

    /// Interactive policies wait for an explicit `resolve_conflict` call
    pub fn is_interactive(&self) -> bool {
        self.requires_confirmation || self.strategy == ResolutionStrategy::UserChoice
    }
}

/// Look up the policy for an action type
pub fn policy_for(action_type: ActionType) -> ResolutionPolicy {
    use ActionPriority::*;
    use ResolutionStrategy::*;

    match action_type {
        ActionType::TradeExecution => ResolutionPolicy::new(FirstWins, true, High, 30_000),
        ActionType::OrderCancellation => ResolutionPolicy::new(FirstWins, false, High, 15_000),
        ActionType::BalanceUpdate => ResolutionPolicy::new(LastWins, false, High, 10_000),
        ActionType::WithdrawalRequest => ResolutionPolicy::new(UserChoice, true, Critical, 60_000),
        ActionType::PortfolioModification => ResolutionPolicy::new(Merge, false, Normal, 15_000),
        ActionType::SettingsUpdate => ResolutionPolicy::new(Merge, false, Low, 10_000),
        ActionType::WatchlistUpdate => ResolutionPolicy::new(Merge, false, Low, 10_000),
        ActionType::AlertManagement => ResolutionPolicy::new(Merge, false, Normal, 10_000),
    }
}

/// Pairwise, type-specific conflict predicate. Symmetric.
pub fn conflicts(existing: &Action, incoming: &Action) -> bool {
    if existing.action_type != incoming.action_type {
        return false;
    }

    let same = |field: &str| existing.field(field) == incoming.field(field);

    match incoming.action_type {
        ActionType::TradeExecution => {
            let symbol = incoming.field("symbol");
            let liquidating =
                existing.field("side") == Some("sell") || incoming.field("side") == Some("sell");
            symbol.is_some() && same("symbol") && liquidating
        }
        ActionType::OrderCancellation => incoming.field("order_id").is_some() && same("order_id"),
        ActionType::BalanceUpdate | ActionType::WithdrawalRequest => {
            incoming.field("currency").is_some() && same("currency")
        }
        // A missing portfolio id on both sides means the default portfolio
        ActionType::PortfolioModification => same("portfolio_id"),
        ActionType::SettingsUpdate | ActionType::WatchlistUpdate | ActionType::AlertManagement => {
            true
        }
    }
}

/// State category a successful action's result feeds
pub fn result_category(action_type: ActionType) -> Option<StateCategory> {
    match action_type {
        ActionType::BalanceUpdate | ActionType::WithdrawalRequest => Some(StateCategory::Balance),
        ActionType::PortfolioModification | ActionType::TradeExecution => {
            Some(StateCategory::Portfolio)
        }
        ActionType::SettingsUpdate => Some(StateCategory::TradingSettings),
        ActionType::WatchlistUpdate => Some(StateCategory::Watchlist),
        ActionType::AlertManagement => Some(StateCategory::Alerts),
        ActionType::OrderCancellation => None,
    }
}
