mod commands;

use anyhow::{Context, Result};
use atelier_db::{AppConfig, Database};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Used when `RUST_LOG` is unset. Covers sqlx and every other crate too.
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser)]
#[command(name = "atelier-db")]
#[command(about = "Operator tooling for the Atelier database: migrations, pool health, session sweeps")]
struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Overrides MIGRATIONS_DIR
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Skip confirmation prompts
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List executed and pending migrations
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply all pending migrations as one batch
    Run,
    /// Revert the most recent batch
    Rollback,
    /// Print pool statistics and run a health check
    Pool,
    /// Delete expired sessions and report capacity
    Sweep,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::from_env().context("failed to read configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(dir) = cli.migrations_dir {
        config.migrations_dir = dir;
    }
    // One-shot commands; the background tasks belong to long-running services.
    config.maintenance_interval = None;
    config.session_sweep_interval = None;

    let db = Database::connect(&config)
        .await
        .with_context(|| format!("failed to connect to {}", config.redacted_database_url()))?;

    let result = match cli.command {
        Command::Status { json } => commands::status(&db, json).await,
        Command::Run => commands::migrate(&db, cli.yes).await,
        Command::Rollback => commands::rollback(&db, cli.yes).await,
        Command::Pool => commands::pool(&db).await,
        Command::Sweep => commands::sweep(&db).await,
    };

    db.shutdown().await;
    result
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
