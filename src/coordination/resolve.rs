//! Resolution strategies and type-specific merges.
//!
//! Pure functions: given the conflicting actions they pick a winner, so every
//! peer that resolves the same record reaches the same outcome. Ordering is by
//! `createdAt`, ties broken by action id.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::action::{Action, ActionId, ActionType};
use super::conflict::{ConflictId, UserChoice};
use super::policy::ResolutionStrategy;
use crate::error::{Result, TabSyncError};

/// Winner, losers and (for merges) the payload the winner now carries
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub winner: ActionId,
    pub rejected: Vec<ActionId>,
    pub merged_payload: Option<Value>,
}

/// Apply `strategy` to the conflicting actions
pub fn resolve_actions(
    conflict_id: &ConflictId,
    strategy: ResolutionStrategy,
    action_type: ActionType,
    actions: &[Action],
    user_choice: Option<&UserChoice>,
) -> Result<Outcome> {
    let mut ordered: Vec<&Action> = actions.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let Some(first) = ordered.first() else {
        return Err(TabSyncError::InvalidState(format!(
            "conflict {} has no actions",
            conflict_id
        )));
    };

    let (winner, merged_payload) = match strategy {
        ResolutionStrategy::FirstWins => (first.id.clone(), None),
        ResolutionStrategy::LastWins => {
            // Latest createdAt; among equal timestamps the lowest id, mirroring first_wins
            let latest = ordered.iter().map(|a| a.created_at).max().unwrap_or(0);
            let winner = ordered
                .iter()
                .find(|a| a.created_at == latest)
                .map(|a| a.id.clone())
                .unwrap_or_else(|| first.id.clone());
            (winner, None)
        }
        ResolutionStrategy::Merge => {
            let carrier = ordered[ordered.len() - 1].id.clone();
            (carrier, Some(merge_payloads(action_type, &ordered)))
        }
        ResolutionStrategy::UserChoice => {
            let selected = user_choice
                .map(|c| &c.selected_action_id)
                .filter(|id| actions.iter().any(|a| &a.id == *id))
                .ok_or_else(|| TabSyncError::MissingUserChoice {
                    conflict_id: conflict_id.to_string(),
                })?;
            (selected.clone(), None)
        }
    };

    let rejected = ordered
        .iter()
        .filter(|a| a.id != winner)
        .map(|a| a.id.clone())
        .collect();

    debug!(
        "Resolved {} with {}: winner {}",
        conflict_id, strategy, winner
    );

    Ok(Outcome {
        winner,
        rejected,
        merged_payload,
    })
}

/// Field-level merge, oldest to newest
pub fn merge_payloads(action_type: ActionType, ordered: &[&Action]) -> Value {
    match action_type {
        ActionType::SettingsUpdate => merge_settings(ordered),
        ActionType::WatchlistUpdate => merge_watchlist(ordered),
        ActionType::AlertManagement => merge_alerts(ordered),
        _ => merge_latest_fields(ordered),
    }
}

/// Generic rule: each top-level field takes the value from the latest action carrying it
pub fn merge_latest_fields(ordered: &[&Action]) -> Value {
    let mut merged = Map::new();
    for action in ordered {
        match &action.payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    merged.insert(key.clone(), value.clone());
                }
            }
            // Scalar payloads have no fields; the latest one replaces everything
            other => return merge_scalar_tail(ordered, other),
        }
    }
    Value::Object(merged)
}

fn merge_scalar_tail(ordered: &[&Action], fallback: &Value) -> Value {
    ordered
        .last()
        .map(|a| a.payload.clone())
        .unwrap_or_else(|| fallback.clone())
}

/// Settings: recursive per-key merge, latest wins at every leaf
pub fn merge_settings(ordered: &[&Action]) -> Value {
    let mut merged = Value::Object(Map::new());
    for action in ordered {
        deep_merge(&mut merged, &action.payload);
    }
    merged
}

fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                let nested = value.is_object() && target.get(key).is_some_and(Value::is_object);
                match target.get_mut(key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

/// Watchlist: replay `operations` in order on top of the earliest `symbols` baseline
pub fn merge_watchlist(ordered: &[&Action]) -> Value {
    let mut symbols: Vec<String> = ordered
        .first()
        .and_then(|a| a.payload.get("symbols"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut operations = Vec::new();
    for action in ordered {
        let Some(ops) = action.payload.get("operations").and_then(|v| v.as_array()) else {
            continue;
        };
        for op in ops {
            let Some(symbol) = op.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            match op.get("op").and_then(|o| o.as_str()) {
                Some("add") => {
                    if !symbols.iter().any(|s| s == symbol) {
                        symbols.push(symbol.to_string());
                    }
                }
                Some("remove") => symbols.retain(|s| s != symbol),
                _ => continue,
            }
            operations.push(op.clone());
        }
    }

    serde_json::json!({
        "symbols": symbols,
        "operations": operations,
    })
}

/// Alerts: keyed by alert id, add/update/delete replayed by timestamp
pub fn merge_alerts(ordered: &[&Action]) -> Value {
    // (timestamp, action order, entry order) keeps the replay total and deterministic
    let mut entries: Vec<(u64, usize, usize, &Map<String, Value>)> = Vec::new();
    for (action_idx, action) in ordered.iter().enumerate() {
        let Some(alerts) = action.payload.get("alerts").and_then(|v| v.as_array()) else {
            continue;
        };
        for (entry_idx, alert) in alerts.iter().enumerate() {
            if let Some(fields) = alert.as_object() {
                let ts = fields
                    .get("timestamp")
                    .and_then(|t| t.as_u64())
                    .unwrap_or(action.created_at);
                entries.push((ts, action_idx, entry_idx, fields));
            }
        }
    }
    entries.sort_by_key(|(ts, a, e, _)| (*ts, *a, *e));

    let mut alerts: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    for (_, _, _, fields) in entries {
        let Some(id) = alert_id(fields) else {
            continue;
        };
        let op = fields.get("action").and_then(|a| a.as_str()).unwrap_or("update");
        if op == "delete" {
            alerts.remove(&id);
            continue;
        }

        let slot = alerts.entry(id).or_default();
        for (key, value) in fields {
            if key != "action" {
                slot.insert(key.clone(), value.clone());
            }
        }
    }

    serde_json::json!({
        "alerts": alerts.into_values().map(Value::Object).collect::<Vec<_>>(),
    })
}

fn alert_id(fields: &Map<String, Value>) -> Option<String> {
    match fields.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PeerId;
    use serde_json::json;

    fn action(t: ActionType, payload: Value, peer: &str, at: u64) -> Action {
        Action::new(t, payload, PeerId::from(peer), at)
    }

    fn cid() -> ConflictId {
        ConflictId::from("conflict_test")
    }

    #[test]
    fn test_first_and_last_wins_ignore_input_order() {
        let early = action(ActionType::BalanceUpdate, json!({"currency": "USD"}), "a", 100);
        let late = action(ActionType::BalanceUpdate, json!({"currency": "USD", "x": 1}), "b", 200);

        for input in [vec![early.clone(), late.clone()], vec![late.clone(), early.clone()]] {
            let first = resolve_actions(&cid(), ResolutionStrategy::FirstWins, ActionType::BalanceUpdate, &input, None).unwrap();
            assert_eq!(first.winner, early.id);
            assert_eq!(first.rejected, vec![late.id.clone()]);

            let last = resolve_actions(&cid(), ResolutionStrategy::LastWins, ActionType::BalanceUpdate, &input, None).unwrap();
            assert_eq!(last.winner, late.id);
            assert_eq!(last.rejected, vec![early.id.clone()]);
        }
    }

    #[test]
    fn test_user_choice_requires_known_action() {
        let a = action(ActionType::WithdrawalRequest, json!({"currency": "BTC"}), "a", 1);
        let b = action(ActionType::WithdrawalRequest, json!({"currency": "BTC", "n": 2}), "b", 2);
        let actions = vec![a.clone(), b.clone()];

        let err = resolve_actions(&cid(), ResolutionStrategy::UserChoice, ActionType::WithdrawalRequest, &actions, None).unwrap_err();
        assert!(matches!(err, TabSyncError::MissingUserChoice { .. }));

        let bogus = UserChoice::select(&ActionId::from("nope"));
        let err = resolve_actions(&cid(), ResolutionStrategy::UserChoice, ActionType::WithdrawalRequest, &actions, Some(&bogus)).unwrap_err();
        assert!(matches!(err, TabSyncError::MissingUserChoice { .. }));

        let choice = UserChoice::select(&b.id);
        let outcome = resolve_actions(&cid(), ResolutionStrategy::UserChoice, ActionType::WithdrawalRequest, &actions, Some(&choice)).unwrap();
        assert_eq!(outcome.winner, b.id);
        assert_eq!(outcome.rejected, vec![a.id]);
    }

    #[test]
    fn test_settings_merge_unions_disjoint_keys_and_latest_wins_shared() {
        let a = action(ActionType::SettingsUpdate, json!({"theme": "dark", "lang": "en"}), "a", 100);
        let b = action(ActionType::SettingsUpdate, json!({"lang": "fr", "leverage": 3}), "b", 200);

        let outcome = resolve_actions(&cid(), ResolutionStrategy::Merge, ActionType::SettingsUpdate, &[b.clone(), a], None).unwrap();
        assert_eq!(outcome.winner, b.id);
        assert_eq!(
            outcome.merged_payload.unwrap(),
            json!({"theme": "dark", "lang": "fr", "leverage": 3})
        );
    }

    #[test]
    fn test_settings_merge_recurses_into_objects() {
        let a = action(ActionType::SettingsUpdate, json!({"notify": {"email": true, "sms": true}}), "a", 1);
        let b = action(ActionType::SettingsUpdate, json!({"notify": {"sms": false}}), "b", 2);
        assert_eq!(
            merge_settings(&[&a, &b]),
            json!({"notify": {"email": true, "sms": false}})
        );
    }

    #[test]
    fn test_generic_merge_is_top_level_latest_wins() {
        let a = action(ActionType::PortfolioModification, json!({"weights": {"BTC": 1}, "name": "x"}), "a", 1);
        let b = action(ActionType::PortfolioModification, json!({"weights": {"ETH": 1}}), "b", 2);
        assert_eq!(
            merge_latest_fields(&[&a, &b]),
            json!({"weights": {"ETH": 1}, "name": "x"})
        );
    }

    #[test]
    fn test_watchlist_replays_operations_in_order() {
        let a = action(
            ActionType::WatchlistUpdate,
            json!({"symbols": ["BTC", "ETH"], "operations": [{"op": "add", "symbol": "SOL"}]}),
            "a",
            100,
        );
        let b = action(
            ActionType::WatchlistUpdate,
            json!({"operations": [{"op": "remove", "symbol": "BTC"}, {"op": "add", "symbol": "SOL"}]}),
            "b",
            200,
        );
        let merged = merge_watchlist(&[&a, &b]);
        assert_eq!(merged["symbols"], json!(["ETH", "SOL"]));
        assert_eq!(merged["operations"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_alert_merge_by_id_and_timestamp() {
        let a = action(
            ActionType::AlertManagement,
            json!({"alerts": [
                {"id": "a1", "action": "add", "price": 100, "timestamp": 10},
                {"id": "a2", "action": "add", "price": 5, "timestamp": 11}
            ]}),
            "a",
            100,
        );
        let b = action(
            ActionType::AlertManagement,
            json!({"alerts": [
                {"id": "a1", "action": "update", "price": 120, "timestamp": 20},
                {"id": "a2", "action": "delete", "timestamp": 5}
            ]}),
            "b",
            200,
        );
        let merged = merge_alerts(&[&a, &b]);
        // a2's delete is older than its add, so the add survives
        assert_eq!(
            merged,
            json!({"alerts": [
                {"id": "a1", "price": 120, "timestamp": 20},
                {"id": "a2", "price": 5, "timestamp": 11}
            ]})
        );
    }
}
