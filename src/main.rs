//! Redlock - Distributed lock command line tool
//!
//! Acquire, hold and release locks against the stores listed in a
//! configuration file, or run several contending clients at once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redlock::config::{LoggingConfig, RedlockConfig};
use redlock::error::{Error, Result};
use redlock::lock::LockManager;

/// Redlock - distributed locks over independent Redis instances
#[derive(Parser)]
#[command(name = "redlock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "redlock.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "redlock.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    CheckConfig,

    /// Acquire a lock, hold it, then release it
    Lock {
        /// Resource name
        resource: String,

        /// Lock TTL in milliseconds
        #[arg(long, default_value_t = 10_000)]
        ttl: u64,

        /// How long to hold the lock, in milliseconds
        #[arg(long, default_value_t = 1_000)]
        hold: u64,
    },

    /// Run several clients competing for the same resource
    Contend {
        /// Resource name
        resource: String,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 3)]
        clients: usize,

        /// Lock TTL in milliseconds
        #[arg(long, default_value_t = 10_000)]
        ttl: u64,

        /// How long each winner holds the lock, in milliseconds
        #[arg(long, default_value_t = 500)]
        hold: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it loads; errors
    // in the file are reported by the command itself.
    let logging = RedlockConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(&logging, cli.log_level.as_deref());

    match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::CheckConfig => run_check_config(cli.config),
        Commands::Lock { resource, ttl, hold } => run_lock(cli.config, resource, ttl, hold).await,
        Commands::Contend {
            resource,
            clients,
            ttl,
            hold,
        } => run_contend(cli.config, resource, clients, ttl, hold).await,
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(config.level.as_str());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format.as_str() {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            token.cancel();
        }
    });
}

/// Write a starter configuration file
fn run_init(output: PathBuf) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!(
            "{} already exists, refusing to overwrite",
            output.display()
        )));
    }

    std::fs::write(&output, RedlockConfig::sample())?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate a configuration file
fn run_check_config(config_path: PathBuf) -> Result<()> {
    match RedlockConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Stores:         {}", config.stores.len());
            for (idx, store) in config.stores.iter().enumerate() {
                println!("    - {} (timeout {:?})", store.url, config.store_timeout(idx));
            }
            println!("  Quorum Size:    {}", config.quorum_size());
            println!("  Drift Factor:   {}", config.lock.drift_factor);
            println!("  Retry Count:    {}", config.lock.retry_count);
            println!("  Retry Delay:    {} ms", config.lock.retry_delay_ms);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Acquire a lock, hold it while the protected work runs, release it
async fn run_lock(config_path: PathBuf, resource: String, ttl: u64, hold: u64) -> Result<()> {
    let config = RedlockConfig::from_file(&config_path)?;
    let locks = LockManager::from_config(&config)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let result = locks
        .with_lock(&resource, ttl, |handle| async move {
            println!("Acquired {}", handle);

            tokio::select! {
                _ = cancel.cancelled() => println!("Interrupted, releasing early"),
                _ = tokio::time::sleep(Duration::from_millis(hold)) => {}
            }

            if handle.is_expired() {
                tracing::warn!("Held {} past its validity", handle.resource());
            }
            Ok::<_, Error>(())
        })
        .await;

    match result {
        Ok(()) => {
            println!("Released {}", resource);
            Ok(())
        }
        Err(e) if e.is_not_acquired() => {
            eprintln!("Could not acquire {}: {}", resource, e);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Spawn `clients` tasks that compete for `resource` through one manager
async fn run_contend(
    config_path: PathBuf,
    resource: String,
    clients: usize,
    ttl: u64,
    hold: u64,
) -> Result<()> {
    let config = RedlockConfig::from_file(&config_path)?;
    let locks = Arc::new(LockManager::from_config(&config)?);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    tracing::info!(
        "{} clients contending for {} (ttl {}ms, hold {}ms)",
        clients,
        resource,
        ttl,
        hold
    );

    let started = Instant::now();
    let mut tasks = tokio::task::JoinSet::new();
    for client in 0..clients {
        let locks = Arc::clone(&locks);
        let resource = resource.clone();
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let outcome = match locks.acquire_with_cancel(&resource, ttl, &cancel).await {
                Ok(handle) => {
                    println!(
                        "[client {}] acquired at +{}ms, token {}",
                        client,
                        started.elapsed().as_millis(),
                        handle.token()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(hold)) => {}
                    }
                    locks.release(&handle).await;
                    Ok(true)
                }
                Err(e) if e.is_not_acquired() => {
                    println!("[client {}] gave up: {}", client, e);
                    Ok(false)
                }
                Err(e) => Err(e),
            };
            (client, outcome)
        });
    }

    let mut winners = 0;
    while let Some(joined) = tasks.join_next().await {
        let (client, outcome) =
            joined.map_err(|e| Error::Internal(format!("client task failed: {}", e)))?;
        match outcome {
            Ok(true) => winners += 1,
            Ok(false) => {}
            Err(Error::Cancelled) => println!("[client {}] cancelled", client),
            Err(e) => tracing::error!("[client {}] error: {}", client, e),
        }
    }

    println!(
        "{} of {} clients held {} in {}ms",
        winners,
        clients,
        resource,
        started.elapsed().as_millis()
    );
    Ok(())
}
