//! Redlock CLI - acquire, release and run commands under a quorum lock

use clap::{Parser, Subcommand};
use redlock_core::config::Config;
use redlock_core::lock::{AcquireOutcome, LockCoordinator, LockHandle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

/// Exit status when the lock could not be acquired
const EXIT_LOCK_BUSY: u8 = 3;

#[derive(Parser)]
#[command(name = "redlock")]
#[command(author, version, about = "Quorum-based distributed lock", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to $REDLOCK_CONFIG_DIR/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a lock and print its handle
    Acquire {
        /// Resource to lock
        resource: String,
        /// Lock TTL in milliseconds (defaults to lock.default_ttl_ms)
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Release a lock held under a token
    Release {
        /// Locked resource
        resource: String,
        /// Token printed by `redlock acquire`
        #[arg(long)]
        token: String,
    },

    /// Run a command while holding a lock
    Run {
        /// Resource to lock
        resource: String,
        /// Lock TTL in milliseconds (defaults to lock.default_ttl_ms)
        #[arg(long)]
        ttl: Option<u64>,
        /// Command and arguments, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List configured lock stores
    Stores,

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
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let default_level = if cli.quiet { "redlock=warn" } else { "redlock=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Acquire { resource, ttl } => {
            cmd_acquire(config_path, &resource, ttl, cli.format, cli.quiet).await
        }

        Commands::Release { resource, token } => {
            cmd_release(config_path, &resource, &token, cli.format, cli.quiet).await
        }

        Commands::Run {
            resource,
            ttl,
            command,
        } => cmd_run(config_path, &resource, ttl, &command, cli.quiet).await,

        Commands::Stores => cmd_stores(config_path, cli.format),

        Commands::Config { action } => cmd_config(config_path, action, cli.quiet),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Load the config from `--config`, or from the default location
fn load_config(config_path: Option<&Path>) -> anyhow::Result<Config> {
    match config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn save_config(config: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    match config_path {
        Some(path) => config.save_to(path),
        None => config.save(),
    }
}

fn load_coordinator(config_path: Option<&Path>) -> anyhow::Result<(Config, LockCoordinator)> {
    let config = load_config(config_path)?;
    let coordinator = config.coordinator().map_err(|e| match e.suggestion() {
        Some(hint) => anyhow::anyhow!("{} (try `{}`)", e, hint),
        None => anyhow::anyhow!(e),
    })?;
    Ok((config, coordinator))
}

async fn cmd_acquire(
    config_path: Option<&Path>,
    resource: &str,
    ttl: Option<u64>,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let (config, coordinator) = load_coordinator(config_path)?;
    let ttl = ttl.unwrap_or(config.lock.default_ttl_ms);

    match coordinator.acquire_with_report(resource, ttl).await? {
        AcquireOutcome::Acquired(handle) => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&handle)?),
                OutputFormat::Text => print_handle(&handle, quiet),
            }
            Ok(ExitCode::SUCCESS)
        }
        AcquireOutcome::Failed(report) => {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Text if !quiet => {
                    println!(
                        "Lock on '{}' not acquired after {} attempt(s).",
                        report.resource, report.attempts
                    );
                    println!(
                        "  Last attempt: {} acquired, {} busy, {} unreachable (quorum {})",
                        report.last_attempt.acquired,
                        report.last_attempt.rejected,
                        report.last_attempt.unreachable,
                        report.quorum
                    );
                    if report.quorum_unreachable() {
                        println!("\nToo many stores are unreachable. Check them with `redlock stores`.");
                    }
                }
                OutputFormat::Text => {}
            }
            Ok(ExitCode::from(EXIT_LOCK_BUSY))
        }
    }
}

fn print_handle(handle: &LockHandle, quiet: bool) {
    if quiet {
        println!("{}", handle.token);
        return;
    }
    println!("Acquired lock on '{}'", handle.resource);
    println!("  Token: {}", handle.token);
    println!("  Validity: {}ms", handle.validity_ms);
    println!("  Expires: {}", handle.expires_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    println!(
        "\nRelease with: redlock release {} --token {}",
        handle.resource, handle.token
    );
}

async fn cmd_release(
    config_path: Option<&Path>,
    resource: &str,
    token: &str,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let (_, coordinator) = load_coordinator(config_path)?;
    let handle = LockHandle::for_release(resource, token);

    let report = coordinator.release(&handle).await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text if !quiet => {
            println!("Released lock on '{}'", resource);
            println!("  Deleted: {}", report.deleted);
            println!("  Not held: {}", report.not_held);
            println!("  Unreachable: {}", report.unreachable);
        }
        OutputFormat::Text => {}
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    config_path: Option<&Path>,
    resource: &str,
    ttl: Option<u64>,
    command: &[String],
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let (config, coordinator) = load_coordinator(config_path)?;
    let ttl = ttl.unwrap_or(config.lock.default_ttl_ms);

    let Some((program, args)) = command.split_first() else {
        return Err(anyhow::anyhow!("No command given. Usage: redlock run <resource> -- <command>"));
    };

    let Some(handle) = coordinator.acquire(resource, ttl).await? else {
        if !quiet {
            eprintln!("Lock on '{}' is busy; not running {}", resource, program);
        }
        return Ok(ExitCode::from(EXIT_LOCK_BUSY));
    };

    info!(resource, program = %program, validity_ms = handle.validity_ms, "Running command under lock");

    let status = tokio::process::Command::new(program)
        .args(args)
        .env("REDLOCK_RESOURCE", &handle.resource)
        .env("REDLOCK_TOKEN", handle.token.as_str())
        .env("REDLOCK_VALIDITY_MS", handle.validity_ms.to_string())
        .status()
        .await;

    if handle.is_expired() {
        warn!(resource, "Lock validity ran out before the command finished");
    }
    coordinator.release(&handle).await;

    let status =
        status.map_err(|e| anyhow::anyhow!("Failed to start '{}': {}", program, e))?;

    Ok(match status.code() {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(code.clamp(1, 255) as u8),
        None => ExitCode::FAILURE,
    })
}

fn cmd_stores(config_path: Option<&Path>, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;

    if format == OutputFormat::Json {
        let value = serde_json::json!({
            "quorum": config.effective_quorum(),
            "stores": config.stores.iter().map(|s| serde_json::json!({
                "url": s.url,
                "timeout_ms": s.timeout_ms,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(ExitCode::SUCCESS);
    }

    if config.stores.is_empty() {
        println!("No stores configured.");
        println!("\nAdd some with: redlock config set stores redis://host-a:6379,redis://host-b:6379,redis://host-c:6379");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Stores:");
    for store in &config.stores {
        println!("  - {} (timeout {}ms)", store.url, store.timeout_ms);
    }
    match config.effective_quorum() {
        Some(quorum) => println!("Quorum: {} of {}", quorum, config.stores.len()),
        None => println!(
            "Quorum: not set (suggested: redlock config set lock.quorum {})",
            config.suggested_quorum()
        ),
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(
    config_path: Option<&Path>,
    action: ConfigAction,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    match action {
        ConfigAction::Get { key } => {
            let config = load_config(config_path)?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = load_config(config_path)?;
            config.set(&key, &value)?;
            save_config(&config, config_path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = load_config(config_path)?;
            for key in Config::keys() {
                println!("{} = {}", key, config.get(key)?);
            }
        }
        ConfigAction::Reset => {
            match config_path {
                Some(path) => Config::default().save_to(path)?,
                None => Config::reset()?,
            }
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => Config::config_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
