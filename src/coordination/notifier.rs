//! Notification delivery collaborator.
//!
//! The coordinator only supplies `{title, message, priority, actions}` when a
//! conflict needs confirmation; rendering is the collaborator's business.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::conflict::{ConflictId, ConflictRecord};
use super::policy::ActionPriority;

/// One button of a confirmation prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAction {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPrompt {
    pub title: String,
    pub message: String,
    pub priority: ActionPriority,
    pub actions: Vec<PromptAction>,
}

impl ConfirmationPrompt {
    /// One "keep" option per conflicting action, plus dismiss
    pub fn for_conflict(record: &ConflictRecord) -> Self {
        let mut actions: Vec<PromptAction> = record
            .actions
            .iter()
            .map(|a| PromptAction {
                id: a.id.to_string(),
                label: format!("Keep {} from {}", a.action_type, a.origin_peer),
            })
            .collect();
        actions.push(PromptAction {
            id: "dismiss".to_string(),
            label: "Decide later".to_string(),
        });

        Self {
            title: format!("Conflicting {} detected", record.action_type),
            message: format!(
                "{} windows attempted the same {} at once. Choose which one should proceed.",
                record.actions.len(),
                record.action_type
            ),
            priority: record.priority,
            actions,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ConfirmationNotifier: Send + Sync {
    fn prompt(&self, conflict_id: &ConflictId, prompt: ConfirmationPrompt);
}

/// Notifier that only logs; used when no UI layer is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ConfirmationNotifier for LogNotifier {
    fn prompt(&self, conflict_id: &ConflictId, prompt: ConfirmationPrompt) {
        info!(
            "Confirmation needed for {} [{}]: {} ({} options)",
            conflict_id,
            prompt.priority,
            prompt.title,
            prompt.actions.len()
        );
    }
}
