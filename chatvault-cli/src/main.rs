use anyhow::{bail, Context, Result};
use chatvault_core::logging::{init_logging_with_config, LogLevel};
use chatvault_core::metrics::init_metrics;
use chatvault_core::{maintenance_loop, ChatStorage, StorageConfigUpdate, VaultSettings};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "chatvault")]
#[command(author, version, about = "Encrypted local chat history", long_about = None)]
struct Args {
    /// Settings file (TOML); environment variables are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a message in the current session
    Send {
        text: String,
        /// Store as a coach reply instead of a user message
        #[arg(long)]
        coach: bool,
    },
    /// Print messages of the current session (or another one)
    History {
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        #[arg(long)]
        session: Option<String>,
    },
    /// List sessions, most recently active first
    Sessions,
    /// Start a new session and make it current
    NewSession { name: Option<String> },
    /// Make an existing session current
    Switch { session_id: String },
    /// Print storage statistics
    Stats,
    /// Show or change the storage policy
    Config {
        #[arg(long)]
        max_messages_per_chunk: Option<u32>,
        #[arg(long)]
        max_sessions_to_keep: Option<u32>,
        #[arg(long)]
        archive_after_days: Option<u32>,
        #[arg(long)]
        encryption: Option<bool>,
    },
    /// Archive stale sessions and prune old archived ones
    Maintain {
        /// Keep running at this interval (e.g. "6h") until Ctrl-C
        #[arg(long)]
        every: Option<String>,
    },
    /// Check storage and encryption
    Health,
    /// Print session metadata and stats as JSON
    Export,
    /// Delete every session, the config and the key
    Clear {
        /// Required to actually delete
        #[arg(long)]
        yes: bool,
    },
}

fn load_settings(args: &Args) -> Result<VaultSettings> {
    let mut settings = match &args.config {
        Some(path) => {
            let path = shellexpand::tilde(path).into_owned();
            VaultSettings::from_file(&path)
                .with_context(|| format!("Failed to load settings from {}", path))?
        }
        None => VaultSettings::from_env()?,
    };

    if let Some(data_dir) = &args.data_dir {
        let data_dir = PathBuf::from(shellexpand::tilde(data_dir).into_owned());
        settings.key_dir = settings.key_dir.map(|_| data_dir.join("keys"));
        settings.data_dir = data_dir;
    }
    if let Some(level) = &args.log_level {
        if LogLevel::from_str(level).is_none() {
            eprintln!("Invalid log level '{}', using '{}'", level, settings.logging.level);
        } else {
            settings.logging.level = level.clone();
        }
    }
    if args.json_logs {
        settings.logging.json_format = true;
    }

    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;

    init_logging_with_config(settings.logging.to_log_config())?;
    init_metrics();

    let storage = Arc::new(ChatStorage::open(&settings)?);
    storage.initialize().await?;

    run(storage, args.command).await
}

async fn run(storage: Arc<ChatStorage>, command: Command) -> Result<()> {
    match command {
        Command::Send { text, coach } => {
            let message = storage.send_message(&text, !coach).await?;
            println!("{}", message.id);
        }
        Command::History { limit, session } => {
            let messages = match session {
                Some(id) => storage.get_session_messages(&id, limit).await?,
                None => match limit {
                    Some(limit) => storage.get_recent_messages(limit).await?,
                    None => storage.get_all_messages().await?,
                },
            };
            for message in messages {
                let who = if message.is_user { "User" } else { "Coach" };
                println!("[{}] {}: {}", message.timestamp.to_rfc3339(), who, message.text);
            }
        }
        Command::Sessions => {
            for session in storage.get_all_sessions().await? {
                println!(
                    "{}  {:<24} {:>5} msgs  last {}{}",
                    session.id,
                    session.name,
                    session.message_count,
                    session.last_message_at.format("%Y-%m-%d %H:%M"),
                    if session.archived { "  (archived)" } else { "" }
                );
            }
        }
        Command::NewSession { name } => {
            let session = storage.create_new_session(name.as_deref()).await?;
            println!("{}", session.id);
        }
        Command::Switch { session_id } => {
            let session = storage.switch_to_session(&session_id).await?;
            println!("Switched to {} ({})", session.name, session.id);
        }
        Command::Stats => {
            let stats = storage.get_storage_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Config {
            max_messages_per_chunk,
            max_sessions_to_keep,
            archive_after_days,
            encryption,
        } => {
            let update = StorageConfigUpdate {
                max_messages_per_chunk,
                max_sessions_to_keep,
                archive_after_days,
                encryption_enabled: encryption,
            };
            let config = if update == StorageConfigUpdate::default() {
                storage.config().await?
            } else {
                storage.update_config(update).await?
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Maintain { every: None } => {
            let report = storage.perform_maintenance().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Maintain { every: Some(every) } => {
            let interval = humantime_duration(&every)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let task = tokio::spawn(maintenance_loop(storage.clone(), interval, shutdown_rx));

            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");
            if shutdown_tx.send(true).is_err() {
                warn!("Maintenance loop already stopped");
            }
            task.await?;
        }
        Command::Health => {
            let report = storage.health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.storage_working {
                bail!("storage is not working");
            }
        }
        Command::Export => {
            let export = storage.export_chat_data().await?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Command::Clear { yes } => {
            if !yes {
                bail!("refusing to delete all chat data without --yes");
            }
            storage.clear_all_data().await?;
            println!("All chat data deleted");
        }
    }

    Ok(())
}

fn humantime_duration(value: &str) -> Result<Duration> {
    let interval = humantime_serde::re::humantime::parse_duration(value)
        .with_context(|| format!("Invalid interval '{}'", value))?;
    if interval.is_zero() {
        bail!("interval must be greater than 0");
    }
    Ok(interval)
}
