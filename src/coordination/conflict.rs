//! Conflict records, resolutions and the bounded resolution history

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

use super::action::{Action, ActionId, ActionType};
use super::policy::{ActionPriority, ResolutionPolicy, ResolutionStrategy};
use crate::transport::PeerId;

/// Default capacity of the resolution history ring buffer
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Identifier shared by every peer that detects the same collision:
/// hash of type, sorted peer ids, sorted action ids and a coarse time bucket.
/// A later collision between the same peers in the same bucket involves
/// different actions and so gets a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(String);

impl ConflictId {
    pub fn derive(
        action_type: ActionType,
        actions: &[Action],
        bucket_ms: u64,
    ) -> Self {
        let mut peers: Vec<&PeerId> = actions.iter().map(|a| &a.origin_peer).collect();
        peers.sort();
        peers.dedup();
        let mut action_ids: Vec<&ActionId> = actions.iter().map(|a| &a.id).collect();
        action_ids.sort();
        action_ids.dedup();

        let earliest = actions.iter().map(|a| a.created_at).min().unwrap_or(0);
        let bucket = earliest / bucket_ms.max(1);

        let mut hasher = Sha256::new();
        hasher.update(action_type.as_str().as_bytes());
        for peer in peers {
            hasher.update([0u8]);
            hasher.update(peer.as_str().as_bytes());
        }
        hasher.update([1u8]);
        for id in action_ids {
            hasher.update(id.as_str().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0u8]);
        hasher.update(bucket.to_be_bytes());
        Self(format!("conflict_{}", hex::encode(&hasher.finalize()[..12])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConflictId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// Selection made by the user for `user_choice` resolutions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChoice {
    pub selected_action_id: ActionId,
}

impl UserChoice {
    pub fn select(action_id: &ActionId) -> Self {
        Self {
            selected_action_id: action_id.clone(),
        }
    }
}

/// Outcome of resolving a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub winner: ActionId,
    /// Losing actions; for merges, the actions absorbed into the winner
    pub rejected: Vec<ActionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_payload: Option<serde_json::Value>,
    pub resolved_at: u64,
    pub resolved_by: PeerId,
}

/// A detected collision between actions of the same type from different peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub strategy: ResolutionStrategy,
    pub actions: Vec<Action>,
    pub priority: ActionPriority,
    pub requires_confirmation: bool,
    pub status: ConflictStatus,
    pub created_at: u64,
    #[serde(default)]
    pub resolved_at: Option<u64>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    pub fn new(
        action_type: ActionType,
        policy: &ResolutionPolicy,
        actions: Vec<Action>,
        bucket_ms: u64,
        now: u64,
    ) -> Self {
        Self {
            id: ConflictId::derive(action_type, &actions, bucket_ms),
            action_type,
            strategy: policy.strategy,
            actions,
            priority: policy.priority,
            requires_confirmation: policy.requires_confirmation,
            status: ConflictStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn involves(&self, action_id: &ActionId) -> bool {
        self.actions.iter().any(|a| &a.id == action_id)
    }

    pub fn action_ids(&self) -> Vec<ActionId> {
        self.actions.iter().map(|a| a.id.clone()).collect()
    }

    /// Add an action that collides with one already in this record
    pub fn absorb(&mut self, action: Action) {
        if !self.involves(&action.id) {
            self.actions.push(action);
        }
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}

/// Bounded ring buffer of resolved conflicts; oldest evicted first
#[derive(Debug, Clone)]
pub struct ConflictHistory {
    entries: VecDeque<ConflictRecord>,
    capacity: usize,
}

impl Default for ConflictHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ConflictHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, record: ConflictRecord) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn contains(&self, id: &ConflictId) -> bool {
        self.entries.iter().any(|r| &r.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Oldest first
    pub fn to_vec(&self) -> Vec<ConflictRecord> {
        self.entries.iter().cloned().collect()
    }
}
