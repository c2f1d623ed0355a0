//! Action Coordinator
//!
//! Tracks in-flight actions from every peer of a user, detects colliding
//! actions with the pairwise policy predicates and resolves the resulting
//! conflicts. All mutation is local and message-driven: remote peers only
//! ever influence this coordinator through [`ActionCoordinator::handle_message`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::action::{Action, ActionId, ActionStatus, ActionType};
use super::config::CoordinatorConfig;
use super::conflict::{ConflictHistory, ConflictId, ConflictRecord, ConflictStatus, Resolution, UserChoice};
use super::notifier::{ConfirmationNotifier, ConfirmationPrompt};
use super::policy::{conflicts, policy_for, result_category, ResolutionStrategy};
use super::resolve::resolve_actions;
use super::sanitize::sanitize;
use crate::clock::Clock;
use crate::error::{Result, TabSyncError};
use crate::sync::{StateSynchronizer, SyncOptions, UpdateSource};
use crate::transport::{Channel, ChannelName, Envelope, PeerId, Transport};

pub const ACTION_START: &str = "action_start";
pub const ACTION_COMPLETE: &str = "action_complete";
pub const CONFLICT_DETECTED: &str = "conflict_detected";
pub const CONFLICT_RESOLVED: &str = "conflict_resolved";

/// Recently finished action ids remembered so late `action_start` messages
/// cannot resurrect them
const RETIRED_CAPACITY: usize = 512;

/// Result of `register_action`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub action_id: ActionId,
    pub can_proceed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<ConflictId>,
}

/// Payload of an `action_complete` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCompletion {
    pub action_id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_actions: usize,
    pub expired_conflicts: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired_actions == 0 && self.expired_conflicts == 0
    }
}

/// Coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub pending_actions: usize,
    pub live_conflicts: usize,
    pub history_len: usize,
    pub registered: u64,
    pub conflicts_detected: u64,
    pub auto_resolved: u64,
    pub resolved: u64,
    pub expired_actions: u64,
    pub expired_conflicts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    registered: AtomicU64,
    conflicts_detected: AtomicU64,
    auto_resolved: AtomicU64,
    resolved: AtomicU64,
    expired_actions: AtomicU64,
    expired_conflicts: AtomicU64,
}

enum Detection {
    Clear,
    Joined(ConflictId),
    Created(ConflictId),
}

/// Prompt built under the tables lock and delivered after it is released
type PendingPrompt = (ConflictId, ConfirmationPrompt);

struct Tables {
    actions: HashMap<ActionId, Action>,
    conflicts: HashMap<ConflictId, ConflictRecord>,
    history: ConflictHistory,
    retired: VecDeque<ActionId>,
}

impl Tables {
    fn retire(&mut self, action_id: &ActionId) {
        self.actions.remove(action_id);
        if self.retired.contains(action_id) {
            return;
        }
        if self.retired.len() >= RETIRED_CAPACITY {
            self.retired.pop_front();
        }
        self.retired.push_back(action_id.clone());
    }

    fn is_retired(&self, action_id: &ActionId) -> bool {
        self.retired.contains(action_id)
    }

    fn conflict_of(&self, action_id: &ActionId) -> Option<ConflictId> {
        self.conflicts
            .values()
            .find(|r| r.involves(action_id))
            .map(|r| r.id.clone())
    }

    fn registration(&self, action_id: &ActionId) -> Registration {
        let conflict_id = self.conflict_of(action_id);
        let pending = self
            .actions
            .get(action_id)
            .is_some_and(|a| a.status == ActionStatus::Pending);
        Registration {
            action_id: action_id.clone(),
            can_proceed: pending && conflict_id.is_none(),
            conflict_id,
        }
    }

    /// Remove an action from every live conflict. Records left with fewer
    /// than two actions are dissolved without resolution.
    fn withdraw(&mut self, action_id: &ActionId) -> Vec<ConflictId> {
        let mut dissolved = Vec::new();
        for record in self.conflicts.values_mut() {
            if record.involves(action_id) {
                record.actions.retain(|a| &a.id != action_id);
                if record.actions.len() < 2 {
                    dissolved.push(record.id.clone());
                }
            }
        }
        for id in &dissolved {
            self.conflicts.remove(id);
        }
        dissolved
    }
}

pub struct ActionCoordinator {
    peer_id: PeerId,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn ConfirmationNotifier>,
    synchronizer: Option<Arc<StateSynchronizer>>,
    start_channel: Channel,
    complete_channel: Channel,
    detected_channel: Channel,
    resolution_channel: Channel,
    tables: RwLock<Tables>,
    counters: Counters,
}

impl ActionCoordinator {
    pub fn new(
        transport: &Transport,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn ConfirmationNotifier>,
        synchronizer: Option<Arc<StateSynchronizer>>,
        config: CoordinatorConfig,
    ) -> Self {
        let history = ConflictHistory::new(config.history_capacity);
        Self {
            peer_id: transport.peer_id().clone(),
            clock,
            notifier,
            synchronizer,
            start_channel: transport.open_channel(ChannelName::SessionActionStart),
            complete_channel: transport.open_channel(ChannelName::SessionActionComplete),
            detected_channel: transport.open_channel(ChannelName::ConflictDetected),
            resolution_channel: transport.open_channel(ChannelName::ConflictResolution),
            tables: RwLock::new(Tables {
                actions: HashMap::new(),
                conflicts: HashMap::new(),
                history,
                retired: VecDeque::new(),
            }),
            counters: Counters::default(),
            config,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Channels the coordinator listens to
    pub fn channels(&self) -> Vec<Channel> {
        vec![
            self.start_channel.clone(),
            self.complete_channel.clone(),
            self.detected_channel.clone(),
            self.resolution_channel.clone(),
        ]
    }

    /// Register an intent by its wire name
    pub async fn register_action_named(
        &self,
        action_type: &str,
        payload: Value,
        peer: Option<PeerId>,
    ) -> Result<Registration> {
        let action_type: ActionType = action_type.parse()?;
        self.register_action(action_type, payload, peer).await
    }

    /// Register an intent and check it against every pending action from
    /// other peers. Non-interactive conflicts are resolved before returning.
    pub async fn register_action(
        &self,
        action_type: ActionType,
        payload: Value,
        peer: Option<PeerId>,
    ) -> Result<Registration> {
        let origin = peer.unwrap_or_else(|| self.peer_id.clone());
        let now = self.clock.now_ms();
        let action = Action::new(action_type, payload, origin, now);

        let mut tables = self.tables.write().await;
        if tables
            .actions
            .get(&action.id)
            .is_some_and(|a| a.status == ActionStatus::Pending)
        {
            debug!(action_id = %action.id, "action already registered");
            return Ok(tables.registration(&action.id));
        }

        tables.actions.insert(action.id.clone(), action.clone());
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        self.announce(&self.start_channel, ACTION_START, &wire_action(&action));
        debug!(action_id = %action.id, action_type = %action_type, "action registered");

        let prompt = match self.detect(&mut tables, &action, None, now) {
            Detection::Clear => None,
            Detection::Joined(conflict_id) if action.origin_peer == self.peer_id => {
                tables.conflicts.get(&conflict_id).and_then(interactive_prompt)
            }
            Detection::Joined(_) => None,
            Detection::Created(conflict_id) => {
                self.on_conflict_created(&mut tables, &conflict_id, now, true)
            }
        };
        let registration = tables.registration(&action.id);
        drop(tables);

        self.deliver(prompt);
        Ok(registration)
    }

    /// Mark an action finished. Successful results feed the synchronizer.
    pub async fn complete_action(
        &self,
        action_id: &ActionId,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let action = {
            let mut tables = self.tables.write().await;
            let action = tables
                .actions
                .remove(action_id)
                .ok_or_else(|| TabSyncError::action_not_found(action_id.as_str()))?;
            tables.retire(action_id);
            for conflict_id in tables.withdraw(action_id) {
                info!(conflict_id = %conflict_id, "conflict dissolved by completion");
            }
            action
        };

        let status = if error.is_some() {
            ActionStatus::Failed
        } else {
            ActionStatus::Completed
        };
        let completion = ActionCompletion {
            action_id: action.id.clone(),
            action_type: action.action_type,
            status,
            result: result.as_ref().map(sanitize),
            error,
        };
        self.announce(&self.complete_channel, ACTION_COMPLETE, &completion);
        info!(action_id = %action.id, status = %status, "action complete");

        if status == ActionStatus::Completed {
            self.forward_result(action.action_type, result).await;
        }
        Ok(())
    }

    /// Resolve a live conflict with its policy strategy or an override
    pub async fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        strategy: Option<ResolutionStrategy>,
        user_choice: Option<UserChoice>,
    ) -> Result<Resolution> {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;

        let resolution = {
            let record = tables
                .conflicts
                .get(conflict_id)
                .ok_or_else(|| TabSyncError::conflict_not_found(conflict_id.as_str()))?;
            self.decide(record, strategy, user_choice.as_ref(), now)?
        };

        apply_resolution(&mut tables, &resolution);
        self.counters.resolved.fetch_add(1, Ordering::Relaxed);
        self.announce(&self.resolution_channel, CONFLICT_RESOLVED, &resolution);
        info!(
            conflict_id = %conflict_id,
            strategy = %resolution.strategy,
            winner = %resolution.winner,
            "conflict resolved"
        );
        Ok(resolution)
    }

    /// False while the action is part of a live conflict
    pub async fn can_proceed(&self, action_id: &ActionId) -> Result<bool> {
        let tables = self.tables.read().await;
        let action = tables
            .actions
            .get(action_id)
            .filter(|a| a.status == ActionStatus::Pending)
            .ok_or_else(|| TabSyncError::action_not_found(action_id.as_str()))?;
        Ok(tables.conflict_of(&action.id).is_none())
    }

    /// Apply a message from another peer
    pub async fn handle_message(&self, channel: ChannelName, envelope: &Envelope) -> Result<()> {
        if envelope.origin == self.peer_id {
            return Ok(());
        }

        match envelope.kind.as_str() {
            ACTION_START => {
                let action: Action = serde_json::from_value(envelope.data.clone())?;
                self.on_remote_start(action).await;
            }
            ACTION_COMPLETE => {
                let completion: ActionCompletion = serde_json::from_value(envelope.data.clone())?;
                let mut tables = self.tables.write().await;
                if tables.actions.contains_key(&completion.action_id) {
                    debug!(action_id = %completion.action_id, "remote action complete");
                }
                tables.retire(&completion.action_id);
                tables.withdraw(&completion.action_id);
            }
            CONFLICT_DETECTED => {
                let record: ConflictRecord = serde_json::from_value(envelope.data.clone())?;
                self.on_remote_conflict(record).await;
            }
            CONFLICT_RESOLVED => {
                let resolution: Resolution = serde_json::from_value(envelope.data.clone())?;
                let mut tables = self.tables.write().await;
                if apply_resolution(&mut tables, &resolution) {
                    info!(
                        conflict_id = %resolution.conflict_id,
                        resolved_by = %resolution.resolved_by,
                        "conflict resolved remotely"
                    );
                }
            }
            other => debug!("Ignoring {} message on {}", other, channel),
        }
        Ok(())
    }

    /// Purge actions and conflicts older than their type's timeout
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        let mut report = SweepReport::default();

        let expired: Vec<ConflictId> = tables
            .conflicts
            .values()
            .filter(|r| r.age_ms(now) > policy_for(r.action_type).timeout_ms)
            .map(|r| r.id.clone())
            .collect();
        for id in expired {
            tables.conflicts.remove(&id);
            warn!(conflict_id = %id, "conflict expired unresolved");
            report.expired_conflicts += 1;
        }

        let expired: Vec<ActionId> = tables
            .actions
            .values()
            .filter(|a| a.age_ms(now) > policy_for(a.action_type).timeout_ms)
            .map(|a| a.id.clone())
            .collect();
        for id in expired {
            tables.retire(&id);
            tables.withdraw(&id);
            debug!(action_id = %id, "action expired");
            report.expired_actions += 1;
        }

        self.counters
            .expired_actions
            .fetch_add(report.expired_actions as u64, Ordering::Relaxed);
        self.counters
            .expired_conflicts
            .fetch_add(report.expired_conflicts as u64, Ordering::Relaxed);
        report
    }

    /// Drop every table, including history (sign-out)
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        tables.actions.clear();
        tables.conflicts.clear();
        tables.history.clear();
        tables.retired.clear();
        info!("Coordinator tables cleared");
    }

    /// Resolved conflicts, oldest first
    pub async fn conflict_history(&self) -> Vec<ConflictRecord> {
        self.tables.read().await.history.to_vec()
    }

    pub async fn live_conflicts(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> =
            self.tables.read().await.conflicts.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn get_conflict(&self, conflict_id: &ConflictId) -> Option<ConflictRecord> {
        self.tables.read().await.conflicts.get(conflict_id).cloned()
    }

    pub async fn pending_actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self.tables.read().await.actions.values().cloned().collect();
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        actions
    }

    pub async fn get_stats(&self) -> CoordinatorStats {
        let tables = self.tables.read().await;
        CoordinatorStats {
            pending_actions: tables.actions.len(),
            live_conflicts: tables.conflicts.len(),
            history_len: tables.history.len(),
            registered: self.counters.registered.load(Ordering::Relaxed),
            conflicts_detected: self.counters.conflicts_detected.load(Ordering::Relaxed),
            auto_resolved: self.counters.auto_resolved.load(Ordering::Relaxed),
            resolved: self.counters.resolved.load(Ordering::Relaxed),
            expired_actions: self.counters.expired_actions.load(Ordering::Relaxed),
            expired_conflicts: self.counters.expired_conflicts.load(Ordering::Relaxed),
        }
    }

    async fn on_remote_start(&self, action: Action) {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        if tables.actions.contains_key(&action.id) || tables.is_retired(&action.id) {
            return;
        }
        debug!(action_id = %action.id, origin = %action.origin_peer, "remote action start");
        tables.actions.insert(action.id.clone(), action.clone());

        // Registrations that crossed in flight: check against our own intents
        let own = self.peer_id.clone();
        let prompt = match self.detect(&mut tables, &action, Some(&own), now) {
            Detection::Created(conflict_id) => {
                self.on_conflict_created(&mut tables, &conflict_id, now, true)
            }
            Detection::Clear | Detection::Joined(_) => None,
        };
        drop(tables);
        self.deliver(prompt);
    }

    async fn on_remote_conflict(&self, record: ConflictRecord) {
        let now = self.clock.now_ms();
        let mut tables = self.tables.write().await;
        if record.status != ConflictStatus::Pending
            || tables.conflicts.contains_key(&record.id)
            || tables.history.contains(&record.id)
        {
            debug!(conflict_id = %record.id, "duplicate conflict report ignored");
            return;
        }

        for action in &record.actions {
            if !tables.is_retired(&action.id) {
                tables
                    .actions
                    .entry(action.id.clone())
                    .or_insert_with(|| action.clone());
            }
        }
        let conflict_id = record.id.clone();
        tables.conflicts.insert(conflict_id.clone(), record);
        let prompt = self.on_conflict_created(&mut tables, &conflict_id, now, false);
        drop(tables);
        self.deliver(prompt);
    }

    /// Find pending actions from other peers that collide with `incoming`.
    /// `against` restricts the scan to one origin peer.
    fn detect(
        &self,
        tables: &mut Tables,
        incoming: &Action,
        against: Option<&PeerId>,
        now: u64,
    ) -> Detection {
        let colliding: Vec<Action> = tables
            .actions
            .values()
            .filter(|a| {
                a.id != incoming.id
                    && a.status == ActionStatus::Pending
                    && a.origin_peer != incoming.origin_peer
                    && against.map_or(true, |peer| &a.origin_peer == peer)
                    && conflicts(a, incoming)
            })
            .cloned()
            .collect();

        if colliding.is_empty() {
            return Detection::Clear;
        }

        // A third party joins the existing record instead of opening another
        if let Some(record) = tables
            .conflicts
            .values_mut()
            .find(|r| colliding.iter().any(|a| r.involves(&a.id)))
        {
            record.absorb(incoming.clone());
            debug!(conflict_id = %record.id, action_id = %incoming.id, "action joined conflict");
            return Detection::Joined(record.id.clone());
        }

        let mut actions = colliding;
        actions.push(incoming.clone());
        actions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let policy = policy_for(incoming.action_type);
        let record = ConflictRecord::new(
            incoming.action_type,
            &policy,
            actions,
            self.config.conflict_bucket_ms,
            now,
        );

        if let Some(live) = tables.conflicts.get_mut(&record.id) {
            live.absorb(incoming.clone());
            return Detection::Joined(live.id.clone());
        }

        let id = record.id.clone();
        tables.conflicts.insert(id.clone(), record);
        self.counters.conflicts_detected.fetch_add(1, Ordering::Relaxed);
        Detection::Created(id)
    }

    /// Announce (when detected here) and auto-resolve a new record, or
    /// return the prompt an interactive one needs on this peer
    fn on_conflict_created(
        &self,
        tables: &mut Tables,
        conflict_id: &ConflictId,
        now: u64,
        detected_here: bool,
    ) -> Option<PendingPrompt> {
        let record = tables.conflicts.get(conflict_id).cloned()?;
        info!(
            conflict_id = %record.id,
            action_type = %record.action_type,
            actions = record.actions.len(),
            "conflict detected"
        );

        if detected_here {
            self.announce(&self.detected_channel, CONFLICT_DETECTED, &record);
        }

        let policy = policy_for(record.action_type);
        if policy.is_interactive() {
            if record.actions.iter().any(|a| a.origin_peer == self.peer_id) {
                return interactive_prompt(&record);
            }
            return None;
        }

        // Strategies are deterministic, so every detecting peer agrees
        match self.decide(&record, None, None, now) {
            Ok(resolution) => {
                apply_resolution(tables, &resolution);
                self.counters.auto_resolved.fetch_add(1, Ordering::Relaxed);
                if detected_here {
                    self.announce(&self.resolution_channel, CONFLICT_RESOLVED, &resolution);
                }
                info!(
                    conflict_id = %record.id,
                    strategy = %resolution.strategy,
                    winner = %resolution.winner,
                    "conflict auto-resolved"
                );
            }
            Err(e) => warn!(conflict_id = %record.id, error = %e, "auto-resolution failed"),
        }
        None
    }

    /// Must be called without the tables lock held
    fn deliver(&self, prompt: Option<PendingPrompt>) {
        if let Some((conflict_id, prompt)) = prompt {
            self.notifier.prompt(&conflict_id, prompt);
        }
    }

    fn decide(
        &self,
        record: &ConflictRecord,
        strategy: Option<ResolutionStrategy>,
        user_choice: Option<&UserChoice>,
        now: u64,
    ) -> Result<Resolution> {
        let strategy = strategy.unwrap_or(record.strategy);
        let outcome = resolve_actions(
            &record.id,
            strategy,
            record.action_type,
            &record.actions,
            user_choice,
        )?;
        Ok(Resolution {
            conflict_id: record.id.clone(),
            strategy,
            winner: outcome.winner,
            rejected: outcome.rejected,
            merged_payload: outcome.merged_payload,
            resolved_at: now,
            resolved_by: self.peer_id.clone(),
        })
    }

    async fn forward_result(&self, action_type: ActionType, result: Option<Value>) {
        let (Some(synchronizer), Some(category), Some(result)) =
            (&self.synchronizer, result_category(action_type), result)
        else {
            return;
        };

        // This peer keeps the full result; other peers get it without secrets
        match synchronizer
            .sync_state_from(
                category,
                result,
                SyncOptions::local_only(),
                UpdateSource::ActionResult(action_type),
            )
            .await
        {
            Ok(record) => {
                synchronizer.broadcast_as(&record, sanitize(&record.value)).await;
            }
            Err(e) => {
                warn!(action_type = %action_type, error = %e, "failed to forward action result");
            }
        }
    }

    /// Best-effort publish; failures are logged
    fn announce<T: Serialize>(&self, channel: &Channel, kind: &str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode {}: {}", kind, e);
                return;
            }
        };
        if let Err(e) = channel.publish(kind, data) {
            warn!("Failed to publish {} on {}: {}", kind, channel.name(), e);
        }
    }
}

fn interactive_prompt(record: &ConflictRecord) -> Option<PendingPrompt> {
    policy_for(record.action_type)
        .is_interactive()
        .then(|| (record.id.clone(), ConfirmationPrompt::for_conflict(record)))
}

/// The action as announced to other peers, secrets stripped
fn wire_action(action: &Action) -> Action {
    Action {
        payload: sanitize(&action.payload),
        ..action.clone()
    }
}

/// Apply a resolution to a live record: the winner stays pending (carrying
/// the merged payload, if any), the rest are rejected and dropped.
/// Returns false when the record is not live here.
fn apply_resolution(tables: &mut Tables, resolution: &Resolution) -> bool {
    let Some(mut record) = tables.conflicts.remove(&resolution.conflict_id) else {
        return false;
    };

    for action in record.actions.iter_mut() {
        if action.id == resolution.winner {
            if let Some(merged) = &resolution.merged_payload {
                action.payload = merged.clone();
                if let Some(live) = tables.actions.get_mut(&action.id) {
                    live.payload = merged.clone();
                }
            }
        } else if resolution.rejected.contains(&action.id) {
            action.status = ActionStatus::Rejected;
            tables.retire(&action.id);
        }
    }

    record.status = ConflictStatus::Resolved;
    record.resolved_at = Some(resolution.resolved_at);
    record.resolution = Some(resolution.clone());
    tables.history.push(record);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordination::notifier::{LogNotifier, MockConfirmationNotifier};
    use crate::store::MemoryStore;
    use crate::transport::{BroadcastHub, DEFAULT_RELAY_PREFIX};
    use serde_json::json;

    fn coordinator_with(
        clock: Arc<ManualClock>,
        notifier: Arc<dyn ConfirmationNotifier>,
    ) -> ActionCoordinator {
        let transport = Transport::connect(
            PeerId::from("peer_local"),
            Some(BroadcastHub::default()),
            Arc::new(MemoryStore::new()),
            DEFAULT_RELAY_PREFIX,
            clock.clone(),
        );
        ActionCoordinator::new(&transport, clock, notifier, None, CoordinatorConfig::default())
    }

    fn coordinator(clock: Arc<ManualClock>) -> ActionCoordinator {
        coordinator_with(clock, Arc::new(LogNotifier))
    }

    #[tokio::test]
    async fn test_register_without_conflict_proceeds() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock);

        let reg = c
            .register_action(ActionType::OrderCancellation, json!({"order_id": "o1"}), None)
            .await
            .unwrap();
        assert!(reg.can_proceed);
        assert!(reg.conflict_id.is_none());
        assert!(c.can_proceed(&reg.action_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock);

        let payload = json!({"order_id": "o1"});
        let first = c
            .register_action(ActionType::OrderCancellation, payload.clone(), None)
            .await
            .unwrap();
        let second = c
            .register_action(ActionType::OrderCancellation, payload, None)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(c.get_stats().await.pending_actions, 1);
    }

    #[tokio::test]
    async fn test_unknown_type_name() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock);

        let err = c
            .register_action_named("teleport", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TabSyncError::UnknownActionType(_)));
    }

    #[tokio::test]
    async fn test_same_peer_never_conflicts() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock.clone());

        c.register_action(ActionType::SettingsUpdate, json!({"a": 1}), None)
            .await
            .unwrap();
        clock.advance(10);
        let reg = c
            .register_action(ActionType::SettingsUpdate, json!({"b": 2}), None)
            .await
            .unwrap();
        assert!(reg.can_proceed);
        assert!(c.live_conflicts().await.is_empty());
    }

    #[tokio::test]
    async fn test_last_wins_auto_resolves() {
        let clock = Arc::new(ManualClock::new(100));
        let c = coordinator(clock.clone());

        let a = c
            .register_action(ActionType::BalanceUpdate, json!({"currency": "USD", "amount": 1}), Some(PeerId::from("a")))
            .await
            .unwrap();
        clock.set(200);
        let b = c
            .register_action(ActionType::BalanceUpdate, json!({"currency": "USD", "amount": 2}), Some(PeerId::from("b")))
            .await
            .unwrap();

        assert!(b.can_proceed);
        assert!(b.conflict_id.is_none(), "record already resolved");
        assert!(c.can_proceed(&a.action_id).await.unwrap_err().is_not_found());

        let history = c.conflict_history().await;
        assert_eq!(history.len(), 1);
        let resolution = history[0].resolution.clone().unwrap();
        assert_eq!(resolution.winner, b.action_id);
        assert_eq!(resolution.rejected, vec![a.action_id]);
        assert_eq!(c.get_stats().await.auto_resolved, 1);
    }

    #[tokio::test]
    async fn test_user_choice_requires_selection() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut notifier = MockConfirmationNotifier::new();
        notifier.expect_prompt().times(1).return_const(());
        let c = coordinator_with(clock.clone(), Arc::new(notifier));

        let mine = c
            .register_action(ActionType::WithdrawalRequest, json!({"currency": "BTC", "amount": 1}), None)
            .await
            .unwrap();
        clock.advance(5);
        let theirs = c
            .register_action(ActionType::WithdrawalRequest, json!({"currency": "BTC", "amount": 2}), Some(PeerId::from("other")))
            .await
            .unwrap();

        let conflict_id = theirs.conflict_id.clone().unwrap();
        assert!(!theirs.can_proceed);
        assert!(!c.can_proceed(&mine.action_id).await.unwrap());

        let err = c.resolve_conflict(&conflict_id, None, None).await.unwrap_err();
        assert!(matches!(err, TabSyncError::MissingUserChoice { .. }));

        let bogus = UserChoice::select(&ActionId::from("withdrawal_request_nope"));
        assert!(c.resolve_conflict(&conflict_id, None, Some(bogus)).await.is_err());

        let resolution = c
            .resolve_conflict(&conflict_id, None, Some(UserChoice::select(&theirs.action_id)))
            .await
            .unwrap();
        assert_eq!(resolution.winner, theirs.action_id);
        assert!(c.can_proceed(&theirs.action_id).await.unwrap());
        assert!(c
            .resolve_conflict(&conflict_id, None, None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_local_action_joining_interactive_conflict_is_prompted() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut notifier = MockConfirmationNotifier::new();
        notifier
            .expect_prompt()
            .withf(|_, prompt| prompt.actions.len() == 4)
            .times(1)
            .return_const(());
        let c = coordinator_with(clock.clone(), Arc::new(notifier));

        for (amount, peer) in [(1, "a"), (2, "b")] {
            clock.advance(5);
            c.register_action(ActionType::WithdrawalRequest, json!({"currency": "BTC", "amount": amount}), Some(PeerId::from(peer)))
                .await
                .unwrap();
        }
        clock.advance(5);
        let mine = c
            .register_action(ActionType::WithdrawalRequest, json!({"currency": "BTC", "amount": 3}), None)
            .await
            .unwrap();

        assert!(!mine.can_proceed);
        assert_eq!(c.live_conflicts().await[0].actions.len(), 3);
    }

    /// Reads the coordinator from inside `prompt`
    #[derive(Default)]
    struct ReentrantNotifier {
        coordinator: std::sync::OnceLock<Arc<ActionCoordinator>>,
        observed: std::sync::Mutex<Vec<Option<usize>>>,
    }

    impl ConfirmationNotifier for ReentrantNotifier {
        fn prompt(&self, _conflict_id: &ConflictId, _prompt: ConfirmationPrompt) {
            use futures::FutureExt;
            let coordinator = self.coordinator.get().expect("coordinator wired");
            let live = coordinator.live_conflicts().now_or_never().map(|c| c.len());
            self.observed.lock().unwrap().push(live);
        }
    }

    #[tokio::test]
    async fn test_prompt_runs_after_tables_are_released() {
        let clock = Arc::new(ManualClock::new(1_000));
        let notifier = Arc::new(ReentrantNotifier::default());
        let c = Arc::new(coordinator_with(clock.clone(), notifier.clone()));
        assert!(notifier.coordinator.set(c.clone()).is_ok());

        c.register_action(ActionType::WithdrawalRequest, json!({"currency": "ETH", "amount": 1}), None)
            .await
            .unwrap();
        clock.advance(5);
        c.register_action(ActionType::WithdrawalRequest, json!({"currency": "ETH", "amount": 2}), Some(PeerId::from("other")))
            .await
            .unwrap();

        assert_eq!(*notifier.observed.lock().unwrap(), vec![Some(1)]);
    }

    #[tokio::test]
    async fn test_strategy_override() {
        let clock = Arc::new(ManualClock::new(100));
        let c = coordinator(clock.clone());

        let a = c
            .register_action(ActionType::TradeExecution, json!({"symbol": "ETH", "side": "sell"}), Some(PeerId::from("a")))
            .await
            .unwrap();
        clock.set(200);
        let b = c
            .register_action(ActionType::TradeExecution, json!({"symbol": "ETH", "side": "sell"}), Some(PeerId::from("b")))
            .await
            .unwrap();

        let resolution = c
            .resolve_conflict(&b.conflict_id.unwrap(), Some(ResolutionStrategy::LastWins), None)
            .await
            .unwrap();
        assert_eq!(resolution.winner, b.action_id);
        assert_eq!(resolution.rejected, vec![a.action_id]);
    }

    #[tokio::test]
    async fn test_completion_dissolves_pair() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock.clone());

        let a = c
            .register_action(ActionType::TradeExecution, json!({"symbol": "SOL", "side": "sell"}), Some(PeerId::from("a")))
            .await
            .unwrap();
        clock.advance(1);
        let b = c
            .register_action(ActionType::TradeExecution, json!({"symbol": "SOL", "side": "buy"}), Some(PeerId::from("b")))
            .await
            .unwrap();
        assert_eq!(c.live_conflicts().await.len(), 1);

        c.complete_action(&a.action_id, None, Some("cancelled".into()))
            .await
            .unwrap();
        assert!(c.live_conflicts().await.is_empty());
        assert!(c.can_proceed(&b.action_id).await.unwrap());
        assert!(c.conflict_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_third_peer_joins_existing_conflict() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = coordinator(clock.clone());

        for (i, peer) in ["a", "b", "c"].iter().enumerate() {
            clock.advance(i as u64 + 1);
            c.register_action(ActionType::TradeExecution, json!({"symbol": "BTC", "side": "sell"}), Some(PeerId::from(*peer)))
                .await
                .unwrap();
        }

        let live = c.live_conflicts().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].actions.len(), 3);
    }

    #[tokio::test]
    async fn test_sweep_expires_and_reports() {
        let clock = Arc::new(ManualClock::new(0));
        let c = coordinator(clock.clone());

        let reg = c
            .register_action(ActionType::BalanceUpdate, json!({"currency": "EUR"}), None)
            .await
            .unwrap();
        clock.set(10_000);
        assert!(c.sweep().await.is_empty());

        clock.set(10_001);
        let report = c.sweep().await;
        assert_eq!(report.expired_actions, 1);
        assert!(c
            .complete_action(&reg.action_id, None, None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let clock = Arc::new(ManualClock::new(0));
        let transport = Transport::connect(
            PeerId::from("peer_local"),
            Some(BroadcastHub::default()),
            Arc::new(MemoryStore::new()),
            DEFAULT_RELAY_PREFIX,
            clock.clone(),
        );
        let config = CoordinatorConfig {
            history_capacity: 2,
            ..Default::default()
        };
        let c = ActionCoordinator::new(&transport, clock.clone(), Arc::new(LogNotifier), None, config);

        for round in 0..3u64 {
            clock.set(round * 100_000);
            let currency = format!("C{}", round);
            c.register_action(ActionType::BalanceUpdate, json!({"currency": currency, "v": 1}), Some(PeerId::from("a")))
                .await
                .unwrap();
            clock.advance(1);
            c.register_action(ActionType::BalanceUpdate, json!({"currency": currency, "v": 2}), Some(PeerId::from("b")))
                .await
                .unwrap();
        }

        let history = c.conflict_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].created_at, 100_001);
    }
}
