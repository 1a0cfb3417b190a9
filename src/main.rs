// ABOUTME: CLI entry point for dual-replicator
// ABOUTME: Parses commands and routes to appropriate handlers

use anyhow::Context;
use clap::{Parser, Subcommand};
use dual_replicator::commands::{self, CommonOptions};
use dual_replicator::registry::Flow;
use dual_replicator::settings::Settings;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dual-replicator")]
#[command(
    about = "Bidirectional MongoDB/PostgreSQL replication with an offline write queue",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Path to the config file (defaults to ~/.dual-replicator/config.toml)
    #[arg(long, global = true, env = "DUAL_REPLICATOR_CONFIG")]
    config: Option<PathBuf>,
    /// Queue database path, overriding the config file
    #[arg(long = "queue-db", global = true)]
    queue_db: Option<PathBuf>,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(
        long = "log-level",
        global = true,
        env = "DUAL_REPLICATOR_LOG",
        default_value = "info"
    )]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a record for replication and attempt it immediately when online
    Enqueue {
        entity_type: String,
        /// Record as a JSON object
        record: String,
        /// Only write to the local queue
        #[arg(long)]
        offline: bool,
    },
    /// Replay every pending queue record
    Drain,
    /// Show queue counts by status
    Stats {
        #[arg(long)]
        entity: Option<String>,
    },
    /// Show the most recently created queue records
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reset a failed record and attempt it once more
    Retry { entity_type: String, id: String },
    /// Delete synced records older than the retention window
    Purge {
        #[arg(long = "older-than-days")]
        older_than_days: Option<u32>,
    },
    /// Copy every record of every compatible entity type in one direction
    FullSync {
        #[arg(long, value_enum)]
        direction: Flow,
    },
    /// Run the sync daemon: change listeners, connectivity trigger and drain loop
    Watch,
    /// Generate a payload encryption key
    Keygen,
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over --log-level; an unparsable level falls back to info
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config_path = match cli.config {
        Some(path) => dual_replicator::utils::expand_home(path)?,
        None => Settings::default_path().context("Failed to locate default config path")?,
    };
    let options = CommonOptions {
        config_path,
        queue_path: cli.queue_db,
    };

    match cli.command {
        Commands::Enqueue {
            entity_type,
            record,
            offline,
        } => commands::enqueue(&options, &entity_type, &record, offline).await,
        Commands::Drain => commands::drain(&options).await,
        Commands::Stats { entity } => commands::stats(&options, entity.as_deref()),
        Commands::History { limit } => commands::history(&options, limit),
        Commands::Retry { entity_type, id } => commands::retry(&options, &entity_type, &id).await,
        Commands::Purge { older_than_days } => commands::purge(&options, older_than_days),
        Commands::FullSync { direction } => commands::full_sync(&options, direction).await,
        Commands::Watch => commands::watch(&options).await,
        Commands::Keygen => commands::keygen(),
    }
}
