pub mod clients;
pub mod config;
pub mod db;
pub mod domain;
pub mod downloads;
pub mod entities;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod settings;
pub mod state;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

pub use config::Config;
use scheduler::TaskScheduler;
use state::SharedState;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "daemon" | "-d" | "--daemon" => run_daemon(config).await,

        "check" | "-c" | "--check" => run_single_check(config).await,

        "status" => cmd_status(config).await,

        "config" | "cfg" => {
            if args.len() < 3 {
                println!("Usage: animarr config <list|get|set> [key] [value]");
                return Ok(());
            }
            match args[2].as_str() {
                "list" | "ls" => cmd_config_list(config).await,
                "get" => {
                    if args.len() < 4 {
                        println!("Usage: animarr config get <key>");
                        return Ok(());
                    }
                    cmd_config_get(config, &args[3]).await
                }
                "set" => {
                    if args.len() < 5 {
                        println!("Usage: animarr config set <key> <value>");
                        println!("Example: animarr config set sonarr_url \"http://localhost:8989\"");
                        return Ok(());
                    }
                    let value = args[4..].join(" ");
                    cmd_config_set(config, &args[3], &value).await
                }
                _ => {
                    println!("Unknown config subcommand: {}", args[2]);
                    println!("Use: list, get, set");
                    Ok(())
                }
            }
        }

        "keygen" => {
            println!("{}", generate_app_key());
            Ok(())
        }

        "init" | "--init" => {
            Config::create_default_if_missing()?;
            println!("✓ Config file created. Edit config.toml and run again.");
            Ok(())
        }

        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }

        _ => {
            println!("Unknown command: {}", args[1]);
            println!();
            print_help();
            Ok(())
        }
    }
}

fn print_help() {
    println!("Animarr - Sonarr ⇄ AnimeWorld download bridge");
    println!("Finds missing anime episodes in Sonarr and downloads them from AnimeWorld");
    println!();
    println!("USAGE:");
    println!("  animarr <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("  daemon            Run as background daemon with scheduler");
    println!("  check             Run the metadata sync and wanted check once");
    println!("  status            Show backend health, tasks and queue");
    println!("  config list       Show all settings");
    println!("  config get <key>  Show one setting");
    println!("  config set <key> <value>");
    println!("                    Change a setting (JSON values accepted)");
    println!("  keygen            Print a fresh app secret");
    println!("  init              Create default config file");
    println!("  help              Show this help message");
    println!();
    println!("EXAMPLES:");
    println!("  animarr config set sonarr_url \"http://localhost:8989\"");
    println!("  animarr config set sonarr_token \"<api key>\"");
    println!("  animarr config set preferred_language \"dub_fallback_sub\"");
    println!("  animarr config set concurrent_downloads 3");
    println!("  animarr check                  # one-shot sync + wanted pass");
    println!("  animarr daemon                 # start background service");
    println!();
    println!("ENVIRONMENT:");
    println!("  HOST, PORT, LOG_LEVEL, APP_KEY override config.toml");
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    info!(
        "Animarr v{} starting in daemon mode...",
        env!("CARGO_PKG_VERSION")
    );

    let state = SharedState::new(config).await?;
    state.start_listeners();
    state.queue.clean_orphaned().await;
    state.sonarr.probe().await;

    let scheduler = Arc::new(TaskScheduler::new(state.clone()).await?);

    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if let Err(e) = scheduler.start().await {
                error!("Scheduler error: {}", e);
            }
        })
    };

    // Keeps the shared health verdict current; settings changes also probe
    // out of band.
    let prober_handle = {
        let sonarr = state.sonarr.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                sonarr.probe().await;
            }
        })
    };

    info!(
        host = %state.config.server.host,
        port = state.config.server.port,
        "Daemon running. Press Ctrl+C to stop."
    );

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown: {}", e),
    }

    scheduler.stop().await;
    scheduler_handle.abort();
    prober_handle.abort();
    info!("Daemon stopped");

    Ok(())
}

async fn run_single_check(config: Config) -> anyhow::Result<()> {
    info!("Running single check...");

    let state = SharedState::new(config).await?;
    state.start_listeners();
    state.sonarr.probe().await;

    let scheduler = TaskScheduler::new(state.clone()).await?;
    scheduler.run_once().await;

    for record in scheduler.records() {
        let outcome = record
            .last_error
            .as_deref()
            .unwrap_or("ok");
        println!("  {:<18} {outcome}", record.name);
    }

    info!("Check complete");
    Ok(())
}

async fn cmd_status(config: Config) -> anyhow::Result<()> {
    let state = SharedState::new(config).await?;
    state.sonarr.probe().await;

    let health = state.sonarr.health().await;
    println!("Animarr Status");
    println!("{:-<60}", "");
    println!(
        "Sonarr:     {}",
        if health.healthy {
            "✓ reachable"
        } else {
            "✗ unreachable (check sonarr_url / sonarr_token)"
        }
    );
    if let Some(checked) = health.last_check {
        println!("Last check: {}", checked.to_rfc3339());
    }

    let snapshot = state.queue.snapshot().await;
    println!();
    println!(
        "Queue:      {} items, {} downloading (max workers per download: {})",
        snapshot.queue_length, snapshot.active_downloads, snapshot.max_workers
    );

    let series = state.store.list_series().await?;
    let folders = state.store.list_root_folders().await?;
    println!("Library:    {} series, {} root folders", series.len(), folders.len());

    println!();
    println!("Task intervals:");
    println!(
        "  update_metadata: every {} min",
        state.settings.update_metadata_interval().await?
    );
    println!(
        "  fetch_wanted:    every {} min",
        state.settings.fetch_wanted_interval().await?
    );

    Ok(())
}

async fn cmd_config_list(config: Config) -> anyhow::Result<()> {
    let state = SharedState::new(config).await?;

    println!("Settings");
    println!("{:-<60}", "");
    for (key, value) in state.settings.list().await? {
        let shown = if key == settings::keys::SONARR_TOKEN && !value.is_null() {
            "\"●●●●●●\"".to_string()
        } else {
            value.to_string()
        };
        println!("  {key:<28} {shown}");
    }
    Ok(())
}

async fn cmd_config_get(config: Config, key: &str) -> anyhow::Result<()> {
    let state = SharedState::new(config).await?;
    println!("{}", state.settings.get_value(key).await?);
    Ok(())
}

async fn cmd_config_set(config: Config, key: &str, raw: &str) -> anyhow::Result<()> {
    let state = SharedState::new(config).await?;

    // Accept JSON; bare words become strings so quoting stays optional.
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));

    state.set_setting(key, &value).await?;
    println!("✓ {key} = {value}");
    Ok(())
}

/// A fresh 32-byte hex secret for `APP_KEY`.
#[must_use]
pub fn generate_app_key() -> String {
    use rand::Rng;

    let mut rng = rand::rng();
    let mut result = String::with_capacity(64);

    for _ in 0..32 {
        let value: u8 = rng.random();
        let _ = write!(result, "{value:02x}");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_keys_are_hex_and_unique() {
        let a = generate_app_key();
        let b = generate_app_key();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
