//! pingtun
//!
//! Brings up a user-space tunnel whose endpoint answers pings, driven
//! through the tunnel lifecycle coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingtun_core::{ConfigurationStore, LocalStore, TunnelManager, TunnelState};
use pingtun_network::SystemTun;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::ClientConfig;

/// How long `up` waits for the tunnel to come down after Ctrl-C
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// pingtun - user-space tunnel answering ICMP echo
#[derive(Parser)]
#[command(name = "pingtun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.pingtun/config.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the tunnel and keep it up until Ctrl-C
    Up,

    /// Look for an existing tunnel configuration
    Detect,

    /// Stop and remove every stored configuration
    Reset,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config)?;
    let config = ClientConfig::load_or_create(&config_path).await?;

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(config.logging.level.as_str());
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    config.validate()?;

    match cli.command {
        Commands::Up => cmd_up(config).await,
        Commands::Detect => cmd_detect(config).await,
        Commands::Reset => cmd_reset(config).await,
        Commands::Config => cmd_config(&config_path).await,
    }
}

async fn cmd_up(config: ClientConfig) -> Result<()> {
    info!("Starting pingtun...");

    let store = open_store(&config).await?;
    let manager = TunnelManager::new(store, config.profile.clone());
    let mut state = manager.subscribe_state();
    let mut errors = manager.subscribe_errors();

    manager.start();
    println!("State: {}", manager.state());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow();
                println!("State: {}", current);
            }
            error = errors.recv() => match error {
                Ok(error) => println!("Error: {}", error),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} tunnel errors", missed),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!("Shutting down...");
                break;
            }
        }
    }

    manager.stop();
    let stopped = tokio::time::timeout(
        SHUTDOWN_TIMEOUT,
        state.wait_for(|state| *state == TunnelState::Disconnected),
    )
    .await;
    if !matches!(stopped, Ok(Ok(_))) {
        warn!("Tunnel did not report disconnected in time");
    }

    manager.shutdown().await;
    Ok(())
}

async fn cmd_detect(config: ClientConfig) -> Result<()> {
    let store = open_store(&config).await?;

    let manager = TunnelManager::new(store.clone(), config.profile.clone());
    tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        while manager.drive_stats().passes_completed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("Detection did not finish")?;

    println!("State: {}", manager.state());
    manager.shutdown().await;

    let configurations = store.load_all().await?;
    if configurations.is_empty() {
        println!("No stored configurations");
        return Ok(());
    }

    println!();
    println!("{:<6} {:<24} {:<14} {:<10} {:<8}",
             "ID", "Description", "Protocol", "Status", "Enabled");
    println!("{}", "-".repeat(66));

    for configuration in configurations {
        let profile = configuration.profile();
        println!("{:<6} {:<24} {:<14} {:<10} {:<8}",
                 configuration.id().to_string(),
                 profile.description,
                 format!("{:?}", profile.protocol),
                 format!("{:?}", configuration.status()),
                 profile.enabled);
    }

    Ok(())
}

async fn cmd_reset(config: ClientConfig) -> Result<()> {
    let store = open_store(&config).await?;

    let configurations = store.load_all().await?;
    let count = configurations.len();
    for configuration in configurations {
        configuration.stop();
        store
            .remove(configuration.id())
            .await
            .with_context(|| format!("Failed to remove configuration {}", configuration.id()))?;
    }

    println!("Removed {} configuration(s)", count);
    Ok(())
}

async fn cmd_config(config_path: &Path) -> Result<()> {
    let config = ClientConfig::load(config_path).await?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}

// Helper functions

async fn open_store(config: &ClientConfig) -> Result<Arc<LocalStore>> {
    let path = expand_path(Path::new(&config.store.path))?;
    let store = LocalStore::open(&path, config.tun_config()?, Arc::new(SystemTun))
        .await
        .with_context(|| format!("Failed to open configuration store {:?}", path))?;
    Ok(Arc::new(store))
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}
