//! `vigilctl` runs the continuous validation daemon and inspects its state.

mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};

#[derive(Parser, Debug)]
#[command(name = "vigilctl")]
#[command(about = "Watch source trees and validate changed files continuously", version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
struct GlobalArgs {
    /// Path to vigil.toml (defaults to ./vigil.toml or ./config/vigil.toml)
    #[arg(long, global = true, env = "VIGIL_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Dotenv file to load before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervised watch pipeline until Ctrl-C or `vigilctl stop`
    Run,
    /// Scan every root once, validate what changed, then exit
    Rescan {
        /// Validate every file, skipping the significance check
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show the last health report written by a running supervisor
    Status {
        /// Print the raw status JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Ask a running supervisor to stop at its next health tick
    Stop,
    /// Inspect or clear the validation result cache
    #[command(subcommand)]
    Cache(CacheCommand),
    /// Summarize recent validation history
    History {
        /// How far back to look (e.g. 24h, 7d)
        #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
        window: Duration,
        /// Only list files validated at least this many times
        #[arg(long, default_value_t = 3)]
        min_count: u32,
    },
    /// Delete validation history older than the retention window
    Prune {
        /// Override store.retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Entry count and on-disk size
    Stats,
    /// Remove every cached result
    Clear,
    /// Apply the TTL and size limits now
    Sweep,
}

impl Command {
    /// Commands that only read or clear local state still work when a
    /// watch root has gone missing.
    fn needs_guard_rails(&self) -> bool {
        matches!(self, Command::Run | Command::Rescan { .. })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let ConfigLoad {
        config,
        warnings,
        source,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: cli.global.config.clone(),
        env_file: cli.global.env_file.clone(),
        skip_guard_rails: !cli.command.needs_guard_rails(),
    })
    .load()
    .context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG, e.g. vigil::debounce=debug for per-event detail.
                "info,vigil::debounce=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = &source {
        tracing::debug!(path = %path.display(), "using configuration file");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    match cli.command {
        Command::Run => {
            let code = commands::run(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Rescan { force } => commands::rescan(config, force).await,
        Command::Status { json } => commands::status(&config, json).await,
        Command::Stop => commands::stop(&config).await,
        Command::Cache(CacheCommand::Stats) => commands::cache_stats(&config).await,
        Command::Cache(CacheCommand::Clear) => commands::cache_clear(&config).await,
        Command::Cache(CacheCommand::Sweep) => commands::cache_sweep(&config).await,
        Command::History { window, min_count } => {
            commands::history(&config, window, min_count).await
        }
        Command::Prune { days } => commands::prune(&config, days).await,
    }
}
