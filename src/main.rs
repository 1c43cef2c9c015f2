use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tabsync::keys::DEFAULT_KEY_PREFIX;
use tabsync::store::merge_patch;
use tabsync::{
    attach, HostStore, MemoryStore, MutationKind, SharedChannel, SqliteChannel, StoreKeys,
    StoreOptions, SyncSettings,
};

const DEFAULT_DB: &str = ".dx/tabsync/channel.db";

#[derive(Parser)]
#[command(name = "tabsync")]
#[command(about = "Share store state between windows through a SQLite channel", version)]
#[command(after_help = "Every invocation of `set` or `watch` behaves like one more window:
it replays the latest snapshot, then takes part in the source/acceptor protocol
until it exits. Run `tabsync watch` in one terminal and `tabsync set` in another.")]
struct Cli {
    /// Channel database shared by all windows
    #[arg(long, global = true, default_value = DEFAULT_DB)]
    db: PathBuf,

    /// TOML sync settings (key prefix, per-store options)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the channel database
    Init,

    /// List channel entries
    Show {
        /// Only the entries of this store
        #[arg(short, long)]
        store: Option<String>,
    },

    /// Join as a window, change a store's state and wait for the flush
    Set {
        #[arg(short, long)]
        store: String,

        /// New state as JSON
        state: String,

        /// Deep-merge into the current state instead of replacing it
        #[arg(long)]
        merge: bool,
    },

    /// Join as a window and print every state received from other windows
    Watch {
        #[arg(short, long)]
        store: String,
    },

    /// Remove a store's snapshot, source marker and acceptor flag
    Clear {
        #[arg(short, long)]
        store: String,
    },
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tabsync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Key prefix and options for a store; without a config file the store is enabled
fn resolve(config: Option<&Path>, store_id: &str) -> Result<(String, StoreOptions)> {
    match config {
        Some(path) => {
            let settings = SyncSettings::load(path)?;
            let options = settings.options_for(store_id);
            Ok((settings.key_prefix, options))
        }
        None => Ok((DEFAULT_KEY_PREFIX.to_string(), StoreOptions::enabled())),
    }
}

fn short(origin: &str) -> &str {
    origin.get(..8).unwrap_or(origin)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_dir.as_deref());

    match cli.command {
        Commands::Init => {
            SqliteChannel::initialize(&cli.db)?;
            println!(
                "{} Channel ready at {}",
                "✓".green(),
                cli.db.display().to_string().bright_white()
            );
            println!("\n{}", "Next steps:".yellow());
            println!(
                "  1. {} - Follow a store",
                "tabsync watch --store <id>".bright_white()
            );
            println!(
                "  2. {} - Change it from another terminal",
                "tabsync set --store <id> '{\"count\":1}'".bright_white()
            );
        }

        Commands::Show { store } => {
            let prefix = match &cli.config {
                Some(path) => SyncSettings::load(path)?.key_prefix,
                None => DEFAULT_KEY_PREFIX.to_string(),
            };
            let channel = SqliteChannel::open(&cli.db)?;
            let wanted = store.as_deref().map(|id| StoreKeys::new(&prefix, id));

            println!("{}", "Channel Entries".cyan().bold());
            println!("{}", "═".repeat(80).bright_black());

            let mut shown = 0;
            for entry in channel.entries()? {
                if let Some(keys) = &wanted {
                    if !keys.all().contains(&entry.key.as_str()) {
                        continue;
                    }
                }
                shown += 1;
                println!(
                    "{} {} {} {}",
                    format!("[{}]", entry.updated_at.format("%Y-%m-%d %H:%M:%S%.3f")).bright_black(),
                    entry.key.bright_white().bold(),
                    entry.value,
                    format!("({})", short(&entry.origin)).bright_black()
                );
            }
            if shown == 0 {
                println!("{}", "(empty)".bright_black());
            }
            println!(
                "{}",
                format!("journal: {} rows", channel.journal_len()?).bright_black()
            );
        }

        Commands::Set {
            store: store_id,
            state,
            merge,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&state).context("state must be valid JSON")?;
            let (prefix, options) = resolve(cli.config.as_deref(), &store_id)?;

            let channel: Arc<dyn SharedChannel> = Arc::new(SqliteChannel::open(&cli.db)?);
            let store = Arc::new(MemoryStore::default());
            let Some(handle) = attach(
                StoreKeys::new(&prefix, &store_id),
                &options,
                store.clone(),
                channel.clone(),
            )?
            else {
                println!(
                    "{} Synchronization is disabled for store {}",
                    "⚠️".bright_yellow(),
                    store_id.bright_yellow()
                );
                return Ok(());
            };

            println!(
                "{} Window {} joined store {}",
                "→".bright_blue(),
                short(&handle.coordinator().window_id().to_string()).bright_yellow(),
                store_id.bright_white()
            );

            if merge {
                store.update(|current| merge_patch(current, value));
            } else {
                store.set(value);
            }

            tokio::time::sleep(options.debounce() + Duration::from_millis(50)).await;
            handle.coordinator().wait_idle().await;

            let snapshot = channel
                .get(handle.coordinator().keys().snapshot())?
                .unwrap_or_else(|| "(none)".to_string());
            println!("{} Snapshot: {}", "✓".green(), snapshot.bright_white());
            handle.detach();
        }

        Commands::Watch { store: store_id } => {
            let (prefix, options) = resolve(cli.config.as_deref(), &store_id)?;

            let channel: Arc<dyn SharedChannel> = Arc::new(SqliteChannel::open(&cli.db)?);
            let store = Arc::new(MemoryStore::default());
            let Some(handle) = attach(
                StoreKeys::new(&prefix, &store_id),
                &options,
                store.clone(),
                channel,
            )?
            else {
                println!(
                    "{} Synchronization is disabled for store {}",
                    "⚠️".bright_yellow(),
                    store_id.bright_yellow()
                );
                return Ok(());
            };

            println!(
                "{}",
                format!("👁  Watching store {} (Ctrl-C to stop)", store_id)
                    .cyan()
                    .bold()
            );
            println!(
                "{} Window: {}",
                "→".bright_blue(),
                handle.coordinator().window_id().to_string().bright_yellow()
            );
            println!("{} State: {}\n", "→".bright_blue(), store.state());

            let mut mutations = store.subscribe();

            loop {
                tokio::select! {
                    mutation = mutations.recv() => match mutation {
                        Ok(mutation) if mutation.kind == MutationKind::Patch => {
                            println!(
                                "{} {}",
                                format!("[{}]", chrono::Local::now().format("%H:%M:%S%.3f")).bright_black(),
                                mutation.state.to_string().bright_white()
                            );
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            handle.detach();
            println!("\n{}", "👁  Watch stopped".cyan());
        }

        Commands::Clear { store: store_id } => {
            let (prefix, _) = resolve(cli.config.as_deref(), &store_id)?;
            let channel = SqliteChannel::open(&cli.db)?;
            for key in StoreKeys::new(&prefix, &store_id).all() {
                channel.remove(key)?;
            }
            println!("{} Cleared store {}", "✓".green(), store_id.bright_white());
        }
    }

    Ok(())
}
