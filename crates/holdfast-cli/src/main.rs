//! Holdfast CLI - hold, inspect, and clear the shared session lock

use anyhow::Context;
use clap::{Parser, Subcommand};
use holdfast_core::clock::{Clock, SystemClock};
use holdfast_core::config::Config;
use holdfast_core::domain::locking::{LockCoordinator, LockSnapshot, force_clear, read_snapshot};
use holdfast_core::storage::FileStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

#[derive(Parser)]
#[command(name = "holdfast")]
#[command(author, version, about = "Single-active-instance session lock", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Shared store directory (overrides `store.dir`)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire the session lock and hold it until interrupted or superseded
    Hold {
        /// Time the handoff cleanup takes, in milliseconds
        #[arg(long, default_value_t = 0)]
        cleanup_ms: u64,
        /// On Ctrl-C, release immediately without running cleanup
        #[arg(long)]
        abrupt: bool,
        /// Release cleanly after this many milliseconds
        #[arg(long = "for", value_name = "MS")]
        hold_for: Option<u64>,
    },

    /// Show who holds the session lock
    Status,

    /// Remove all lock and request records
    Clear,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("holdfast=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Hold {
            cleanup_ms,
            abrupt,
            hold_for,
        } => {
            let store = open_store(cli.store_dir)?;
            cmd_hold(store, cleanup_ms, abrupt, hold_for, cli.quiet).await
        }

        Commands::Status => {
            let store = open_store(cli.store_dir)?;
            cmd_status(store, cli.format)
        }

        Commands::Clear => {
            let store = open_store(cli.store_dir)?;
            cmd_clear(store, cli.quiet)
        }

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

/// Store and settings for lock commands
struct OpenStore {
    config: Config,
    dir: PathBuf,
    store: FileStore,
}

fn open_store(store_dir: Option<PathBuf>) -> anyhow::Result<OpenStore> {
    let config = Config::load()?;
    let dir = match store_dir {
        Some(dir) => dir,
        None => config.store_dir()?,
    };
    let store = FileStore::open(&dir, config.poll_interval())
        .with_context(|| format!("Failed to open store at {}", dir.display()))?;
    Ok(OpenStore { config, dir, store })
}

async fn simulate_cleanup(delay: Duration) -> anyhow::Result<()> {
    info!(delay_ms = delay.as_millis() as u64, "Running handoff cleanup");
    sleep(delay).await;
    Ok(())
}

async fn sleep_for(duration: Option<Duration>) {
    match duration {
        Some(duration) => sleep(duration).await,
        None => std::future::pending().await,
    }
}

async fn cmd_hold(
    open: OpenStore,
    cleanup_ms: u64,
    abrupt: bool,
    hold_for: Option<u64>,
    quiet: bool,
) -> anyhow::Result<()> {
    let OpenStore { config, dir, store } = open;
    let lock = LockCoordinator::new(Arc::new(store), config.lock_config());
    let cleanup = Duration::from_millis(cleanup_ms);

    if !quiet {
        println!(
            "Instance {} requesting session lock in {}",
            lock.id(),
            dir.display()
        );
    }

    let acquired = tokio::select! {
        acquired = lock.acquire(move || simulate_cleanup(cleanup)) => acquired?,
        _ = tokio::signal::ctrl_c() => {
            // The holder clears our request when it hands off
            if !quiet {
                println!("Interrupted while waiting for the session lock.");
            }
            return Ok(());
        }
    };

    if !acquired {
        if !quiet {
            println!("Another instance is already waiting for the session lock. Backing off.");
        }
        return Ok(());
    }
    if !quiet {
        println!("Session lock acquired. Press Ctrl-C to release.");
    }

    let mut state = lock.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            if abrupt {
                lock.shutdown_abrupt();
            } else {
                lock.shutdown().await;
            }
            if !quiet {
                println!("Session lock released.");
            }
        }
        _ = state.wait_for(|s| s.is_terminal()) => {
            if !quiet {
                println!("Session lock handed off to another instance.");
            }
        }
        _ = sleep_for(hold_for.map(Duration::from_millis)) => {
            lock.release().await;
            if !quiet {
                println!("Session lock released.");
            }
        }
    }

    Ok(())
}

fn cmd_status(open: OpenStore, format: OutputFormat) -> anyhow::Result<()> {
    let stale_ms = i64::try_from(open.config.lock.stale_timeout_ms).unwrap_or(i64::MAX);
    let snapshot = read_snapshot(&open.store, SystemClock.now_ms(), stale_ms, None)
        .context("Failed to read session lock")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        OutputFormat::Text => print_snapshot(&snapshot),
    }
    Ok(())
}

fn print_snapshot(snapshot: &LockSnapshot) {
    println!("Status: {}", snapshot.status);
    match &snapshot.holder {
        Some(holder) => {
            println!("Holder: {}", holder.holder_id);
            if let Some(age) = snapshot.heartbeat_age_ms {
                println!("Last heartbeat: {} ms ago", age);
            }
        }
        None => println!("Holder: none"),
    }
    match &snapshot.request {
        Some(request) => println!("Pending request: {}", request.requester_id),
        None => println!("Pending request: none"),
    }
}

fn cmd_clear(open: OpenStore, quiet: bool) -> anyhow::Result<()> {
    force_clear(&open.store).context("Failed to clear session lock")?;
    if !quiet {
        println!("Cleared session lock records in {}", open.dir.display());
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_arguments() {
        let cli = Cli::try_parse_from([
            "holdfast",
            "hold",
            "--cleanup-ms",
            "2000",
            "--for",
            "500",
            "--store-dir",
            "/tmp/lock",
        ])
        .unwrap();

        assert_eq!(cli.store_dir, Some(PathBuf::from("/tmp/lock")));
        match cli.command {
            Commands::Hold {
                cleanup_ms,
                abrupt,
                hold_for,
            } => {
                assert_eq!(cleanup_ms, 2000);
                assert!(!abrupt);
                assert_eq!(hold_for, Some(500));
            }
            _ => panic!("expected hold"),
        }
    }

    #[test]
    fn test_status_accepts_json_format() {
        let cli = Cli::try_parse_from(["holdfast", "status", "--format", "json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
        assert!(matches!(cli.format, OutputFormat::Json));
    }

    #[test]
    fn test_config_set_requires_value() {
        assert!(Cli::try_parse_from(["holdfast", "config", "set", "lock.stale_timeout_ms"]).is_err());
    }
}
