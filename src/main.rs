use clap::Parser;
use tabsync::cli::{self, Cli, Commands};
use tabsync::config::{AppConfig, LoggingConfig};
use tabsync::error::{Result, TabSyncError};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match &cli.command {
        Commands::Simulate {
            peers,
            fallback,
            duration_ms,
        } => {
            init_logging(&config.logging);
            info!("Starting simulation with {} peers", peers);
            cli::run_simulation(&config, *peers, *fallback, *duration_ms).await?;
        }
        Commands::Policies => {
            init_logging_simple();
            cli::print_policies();
        }
        Commands::Config => {
            init_logging_simple();
            cli::print_config(&config)?;
        }
        Commands::Inspect { dir } => {
            init_logging_simple();
            let dir = dir.clone().unwrap_or_else(|| config.store.resolved_dir());
            cli::inspect_store(&dir, &config)?;
        }
    }

    Ok(())
}

fn load_config(dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(dir)?;
    config
        .validate()
        .map_err(|errors| TabSyncError::InvalidState(errors.join("; ")))?;
    Ok(config)
}

/// Console logging, plus JSON and daily rolling file output when configured
fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_directive = if logging.level == "info" {
        "info,tabsync=debug".to_string()
    } else {
        logging.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // Prefer TABSYNC_LOG_DIR, then the configured directory
    let log_dir = std::env::var("TABSYNC_LOG_DIR")
        .ok()
        .map(std::path::PathBuf::from)
        .or_else(|| logging.dir.clone());

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so writability is checked first.
    let file_layer = log_dir.and_then(|log_dir| {
        if std::fs::create_dir_all(&log_dir).is_err() {
            eprintln!(
                "Warning: Could not create log directory {}, file logging disabled",
                log_dir.display()
            );
            return None;
        }
        let test_path = log_dir.join(".tabsync_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(&log_dir, "tabsync.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Keep the guard alive for the life of the process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir.display(),
                    e
                );
                None
            }
        }
    });

    let (console_layer, json_layer) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        info!("File logging enabled");
    }
}

fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
