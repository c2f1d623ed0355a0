//! Cross-peer action coordination
//!
//! This module keeps concurrent peers of one user from executing conflicting
//! actions:
//! - Policy table and pairwise conflict predicates per action type
//! - Conflict records with a bounded resolution history
//! - Deterministic resolution strategies and type-specific merges
//! - Secret stripping before anything leaves the peer

pub mod action;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod notifier;
pub mod policy;
pub mod resolve;
pub mod sanitize;

pub use action::{Action, ActionId, ActionStatus, ActionType};
pub use config::CoordinatorConfig;
pub use conflict::{ConflictHistory, ConflictId, ConflictRecord, ConflictStatus, Resolution, UserChoice};
pub use coordinator::{
    ActionCompletion, ActionCoordinator, CoordinatorStats, Registration, SweepReport,
};
pub use notifier::{ConfirmationNotifier, ConfirmationPrompt, LogNotifier, PromptAction};
pub use policy::{
    conflicts, policy_for, result_category, ActionPriority, ResolutionPolicy, ResolutionStrategy,
};
pub use resolve::{merge_payloads, resolve_actions, Outcome};
pub use sanitize::sanitize;
