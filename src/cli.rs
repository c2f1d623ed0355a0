use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, StoreBackend};
use crate::coordination::{policy_for, ActionType};
use crate::error::{Result, TabSyncError};
use crate::peer::{PeerDeps, PeerRuntime, StaticAuth};
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::sync::{StateCategory, StoredState, SyncOptions};
use crate::transport::{BroadcastHub, PeerId};

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(version)]
#[command(about = "Cross-context action coordination and state replication", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory
    #[arg(short, long, default_value = "config", env = "TABSYNC_CONFIG_DIR", global = true)]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run several in-process peers against one hub and print converged state
    Simulate {
        /// Number of peers
        #[arg(short, long, default_value = "3")]
        peers: usize,
        /// Force the storage-relay transport
        #[arg(long)]
        fallback: bool,
        /// How long to let debounced broadcasts settle (ms)
        #[arg(long, default_value = "1500")]
        duration_ms: u64,
    },
    /// Print the resolution policy table
    Policies,
    /// Print the effective configuration as TOML
    Config,
    /// List persisted state entries of a file store
    Inspect {
        /// Store directory (defaults to the configured one)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
}

/// Print the policy table
pub fn print_policies() {
    println!(
        "{:<24} {:<12} {:<8} {:<9} {:>8}",
        "TYPE", "STRATEGY", "CONFIRM", "PRIORITY", "TIMEOUT"
    );
    println!("{}", "-".repeat(65));
    for action_type in ActionType::ALL {
        let policy = policy_for(action_type);
        println!(
            "{:<24} {:<12} {:<8} {:<9} {:>7}s",
            action_type.as_str(),
            policy.strategy.to_string(),
            if policy.requires_confirmation { "yes" } else { "no" },
            policy.priority.to_string(),
            policy.timeout_ms / 1000
        );
    }
}

pub fn print_config(config: &AppConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!(e))?;
    println!("{}", rendered);
    Ok(())
}

/// List every persisted category under `dir`
pub fn inspect_store(dir: &Path, config: &AppConfig) -> Result<()> {
    if !dir.exists() {
        return Err(TabSyncError::InvalidState(format!(
            "store directory {} does not exist",
            dir.display()
        )));
    }

    let store = FileStore::new(dir);
    let keys = store.keys(&config.sync.state_prefix())?;
    if keys.is_empty() {
        println!("No persisted state in {}", dir.display());
        return Ok(());
    }

    println!("{:<40} {:>15} {:<32}", "KEY", "TIMESTAMP", "LAST UPDATED");
    for key in keys {
        let Some(raw) = store.get(&key)? else {
            continue;
        };
        match serde_json::from_str::<StoredState>(&raw) {
            Ok(stored) => println!(
                "{:<40} {:>15} {:<32}",
                key, stored.timestamp, stored.last_updated
            ),
            Err(e) => println!("{:<40} <unreadable: {}>", key, e),
        }
    }
    Ok(())
}

/// Drive a few peers through conflicting actions and concurrent state
/// updates, then report whether their state converged.
pub async fn run_simulation(
    config: &AppConfig,
    peers: usize,
    fallback: bool,
    duration_ms: u64,
) -> Result<()> {
    let peers = peers.max(2);
    let hub = BroadcastHub::default();
    let store: Arc<dyn KeyValueStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::new(&config.store.resolved_dir())),
    };
    let auth = Arc::new(StaticAuth::signed_in("demo"));

    let mut runtimes = Vec::with_capacity(peers);
    for i in 0..peers {
        let hub = if fallback { None } else { Some(hub.clone()) };
        let deps = PeerDeps::new(hub, store.clone(), auth.clone());
        let peer = PeerRuntime::new(PeerId::from(format!("peer_{}", i).as_str()), deps, config);
        peer.init().await?;
        runtimes.push(peer);
    }
    let settle = || tokio::time::sleep(Duration::from_millis(50));

    println!("== {} peers ({} transport)", peers, if fallback { "relay" } else { "native" });

    // Concurrent settings changes: merged
    for (i, peer) in runtimes.iter().enumerate() {
        let mut prefs = serde_json::Map::new();
        prefs.insert(format!("pref_{}", i), json!(true));
        peer.coordinator()
            .register_action(ActionType::SettingsUpdate, prefs.into(), None)
            .await?;
    }
    settle().await;

    // Liquidation racing a buy: needs confirmation
    let sell = runtimes[0]
        .coordinator()
        .register_action(ActionType::TradeExecution, json!({"symbol": "BTC", "side": "sell"}), None)
        .await?;
    runtimes[1]
        .coordinator()
        .register_action(ActionType::TradeExecution, json!({"symbol": "BTC", "side": "buy"}), None)
        .await?;
    settle().await;

    for conflict in runtimes[0].coordinator().live_conflicts().await {
        let resolution = runtimes[0]
            .coordinator()
            .resolve_conflict(&conflict.id, None, None)
            .await?;
        println!(
            "resolved {} ({}): winner {}",
            conflict.id, resolution.strategy, resolution.winner
        );
    }
    if matches!(runtimes[0].coordinator().can_proceed(&sell.action_id).await, Ok(true)) {
        runtimes[0]
            .coordinator()
            .complete_action(&sell.action_id, Some(json!({"positions": {"BTC": 0}})), None)
            .await?;
    }

    // Every peer writes the balance in random order; the last write must win everywhere
    let mut order: Vec<usize> = (0..peers).collect();
    order.shuffle(&mut rand::thread_rng());
    for i in order {
        runtimes[i]
            .synchronizer()
            .sync_state(StateCategory::Balance, json!({"usd": 1_000 + i}), SyncOptions::default())
            .await?;
        settle().await;
    }

    tokio::time::sleep(Duration::from_millis(duration_ms)).await;

    let mut views = Vec::with_capacity(peers);
    for peer in &runtimes {
        let snapshot = peer.synchronizer().snapshot().await;
        println!("-- {}", peer.peer_id());
        for record in &snapshot {
            println!(
                "   {:<18} @{:<14} {}",
                record.category.as_str(),
                record.timestamp,
                record.value
            );
        }
        let stats = peer.coordinator().get_stats().await;
        println!(
            "   conflicts: {} detected, {} auto-resolved, {} in history",
            stats.conflicts_detected, stats.auto_resolved, stats.history_len
        );
        views.push(
            snapshot
                .into_iter()
                .map(|r| (r.category, r.value))
                .collect::<Vec<_>>(),
        );
    }

    let converged = views.windows(2).all(|pair| pair[0] == pair[1]);
    println!("== converged: {}", if converged { "yes" } else { "no" });

    for peer in &runtimes {
        peer.dispose().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_simulate() {
        let cli = Cli::parse_from(["tabsync", "simulate", "--peers", "4", "--fallback"]);
        match cli.command {
            Commands::Simulate { peers, fallback, duration_ms } => {
                assert_eq!(peers, 4);
                assert!(fallback);
                assert_eq!(duration_ms, 1500);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_inspect_lists_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let stored = StoredState {
            state: json!({"usd": 1}),
            timestamp: 42,
            last_updated: "2026-01-01T00:00:00Z".into(),
        };
        store
            .set("tabsync:state:balance", &serde_json::to_string(&stored).unwrap())
            .unwrap();

        assert!(inspect_store(dir.path(), &AppConfig::default()).is_ok());
        assert!(inspect_store(&dir.path().join("missing"), &AppConfig::default()).is_err());
    }
}
