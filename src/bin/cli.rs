//! tenarch-sync CLI
//!
//! Operator tool for the offline cache: inspect cached tables, queue
//! changes, run sync passes and manage dead letters.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenarch_sync::cache::detect_format;
use tenarch_sync::remote::{InMemoryBackend, RemoteBackend};
use tenarch_sync::{
    merge_backups, normalize_backup, parse_backup, CacheEvent, ChangeOperation, EventFilter,
    QueueEntryId, QueuedChange, StorageMode, SyncConfig, SyncEngine, SyncReport, SyncStatus,
};

#[derive(Parser)]
#[command(name = "tenarch-sync")]
#[command(about = "Offline cache and sync tool for the tenarch CRM")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "TENARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Cache database path (overrides the config file)
    #[arg(long, env = "TENARCH_DB_PATH")]
    db_path: Option<String>,

    /// Storage mode: local (WAL) or cloud-safe (DELETE journal)
    #[arg(long, env = "TENARCH_STORAGE_MODE")]
    storage_mode: Option<StorageMode>,

    /// Base URL of the hosted backend
    #[arg(long, env = "TENARCH_REMOTE_URL")]
    remote_url: Option<String>,

    /// Public API key for the backend
    #[arg(long, env = "TENARCH_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// User session token
    #[arg(long, env = "TENARCH_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Timeout for each remote call, in milliseconds
    #[arg(long, env = "TENARCH_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Log output format
    #[arg(long, env = "TENARCH_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status
    Status,
    /// Show storage usage per table
    Info,
    /// Pull every table, then push queued changes
    Sync,
    /// Re-pull every table in full, then push queued changes
    ForceSync,
    /// List cached records of a table
    List {
        table: String,
        /// Maximum number to print
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Show one cached record
    Get { table: String, id: String },
    /// Apply a change locally and queue it for the backend
    Queue {
        table: String,
        /// insert, update or delete
        operation: ChangeOperation,
        /// Record as a JSON object
        data: String,
    },
    /// List pending changes
    Pending,
    /// List dead-lettered changes
    DeadLetters,
    /// Requeue a dead-lettered change
    Retry { id: QueueEntryId },
    /// Drop a dead-lettered change
    Discard { id: QueueEntryId },
    /// Export cached tables as JSON
    Export {
        /// Output file (- for stdout)
        #[arg(short, long, default_value = "-")]
        output: String,
    },
    /// Import cached tables from JSON exports or CRM backups (merged in order)
    Import {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Run the background worker and print status and cache events
    Watch {
        /// Only show events for these tables
        #[arg(short, long)]
        table: Vec<String>,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };

    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(mode) = cli.storage_mode {
        config.storage_mode = mode;
    }
    if let Some(url) = &cli.remote_url {
        config.remote.url = Some(url.clone());
    }
    if let Some(key) = &cli.api_key {
        config.remote.api_key = Some(key.clone());
    }
    if let Some(token) = &cli.access_token {
        config.remote.access_token = Some(token.clone());
    }
    if let Some(timeout) = cli.timeout_ms {
        config.request_timeout_ms = timeout;
    }
    // Short-lived process: pushes are run explicitly
    config.push_on_write = false;

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "rest")]
fn remote_backend(config: &SyncConfig) -> anyhow::Result<Option<Arc<dyn RemoteBackend>>> {
    let backend = tenarch_sync::RestBackend::from_config(&config.remote, config.request_timeout())?;
    Ok(backend.map(|b| Arc::new(b) as Arc<dyn RemoteBackend>))
}

#[cfg(not(feature = "rest"))]
fn remote_backend(config: &SyncConfig) -> anyhow::Result<Option<Arc<dyn RemoteBackend>>> {
    if config.remote.url.is_some() {
        tracing::warn!("Built without the `rest` feature; remote.url is ignored");
    }
    Ok(None)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_status(status: &SyncStatus) {
    println!(
        "{} | {} | pending: {} | dead letters: {}",
        if status.is_online { "online" } else { "offline" },
        if status.is_syncing { "syncing" } else { "idle" },
        status.pending_changes,
        status.dead_letters
    );
    match status.last_synced_at {
        Some(at) => println!("Last synced: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("Last synced: never"),
    }
    if status.storage_degraded {
        println!("Storage: memory-only (durable store failed)");
    }
    if let Some(error) = &status.error {
        println!("Error: {}", error);
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "{:?}: {} tables pulled ({} failed), {} records ({} skipped), {} changes pushed, {} failed, {} dead-lettered",
        report.outcome,
        report.tables_pulled,
        report.tables_failed,
        report.records_pulled,
        report.records_skipped,
        report.changes_pushed,
        report.changes_failed,
        report.changes_dead_lettered
    );
    for error in &report.errors {
        println!("  {}", error);
    }
}

fn print_changes(changes: &[QueuedChange]) {
    if changes.is_empty() {
        println!("(none)");
    }
    for change in changes {
        println!(
            "{} #{} {} {}/{} attempts={} queued={}{}",
            change.id,
            change.seq,
            change.operation,
            change.table,
            change.record_id,
            change.attempts,
            change.queued_at.format("%Y-%m-%d %H:%M:%S"),
            change
                .last_error
                .as_deref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
}

fn print_event(event: &CacheEvent) {
    println!(
        "{} {:?} {}{} ({:?}{})",
        event.timestamp.format("%H:%M:%S%.3f"),
        event.kind,
        event.table,
        event
            .record_id
            .as_deref()
            .map(|id| format!("/{}", id))
            .unwrap_or_default(),
        event.source,
        if event.persisted { "" } else { ", not persisted" }
    );
}

enum WatchItem {
    Status(SyncStatus),
    Event(CacheEvent),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(&cli)?;
    let remote = remote_backend(&config)?;
    let has_remote = remote.is_some();
    let remote = remote.unwrap_or_else(|| Arc::new(InMemoryBackend::new()));

    let engine = SyncEngine::open(config, remote)?;
    if !has_remote {
        tracing::info!("No remote configured; working offline");
        engine.set_online(false);
    }

    let require_remote = || -> anyhow::Result<()> {
        if !has_remote {
            bail!("no remote configured (set --remote-url and --api-key)");
        }
        Ok(())
    };

    match cli.command {
        Commands::Status => {
            let status = engine.status();
            if cli.json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
        }

        Commands::Info => {
            let info = engine.storage_info();
            if cli.json {
                print_json(&info)?;
            } else {
                for (table, count) in &info.table_counts {
                    println!("{:<14} {:>8}", table, count);
                }
                println!("{:<14} {:>8}", "total", info.record_count());
                println!("Cached bytes: {}", info.total_bytes);
                if let Some(bytes) = info.durable_bytes {
                    println!("Database size: {}", bytes);
                }
                if let Some(quota) = info.quota_bytes {
                    println!("Quota: {}", quota);
                }
                if info.memory_only {
                    println!("Storage: memory-only");
                }
            }
        }

        Commands::Sync => {
            require_remote()?;
            let report = engine.sync_all().await;
            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Commands::ForceSync => {
            require_remote()?;
            let report = engine.force_full_sync().await;
            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Commands::List { table, limit } => {
            let rows = engine.get_data(&table);
            let limit = limit.unwrap_or(rows.len());
            if cli.json {
                print_json(&rows.iter().take(limit).collect::<Vec<_>>())?;
            } else {
                for row in rows.iter().take(limit) {
                    println!("{}", serde_json::to_string(row)?);
                }
                println!("{} of {} records", limit.min(rows.len()), rows.len());
            }
        }

        Commands::Get { table, id } => match engine.get_item(&table, &id) {
            Some(row) => print_json(&row)?,
            None => bail!("{}/{} is not cached", table, id),
        },

        Commands::Queue {
            table,
            operation,
            data,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("data must be a JSON object")?;
            let id = engine.queue_change(&table, operation, data)?;
            println!("Queued {} on {} as {}", operation, table, id);

            if has_remote {
                let report = engine.push_pending().await;
                if !cli.json {
                    print_report(&report);
                }
            }
        }

        Commands::Pending => {
            let changes = engine.pending_changes();
            if cli.json {
                print_json(&changes)?;
            } else {
                print_changes(&changes);
            }
        }

        Commands::DeadLetters => {
            let changes = engine.dead_letters();
            if cli.json {
                print_json(&changes)?;
            } else {
                print_changes(&changes);
            }
        }

        Commands::Retry { id } => {
            engine.retry_dead_letter(id)?;
            println!("Requeued {}", id);
        }

        Commands::Discard { id } => {
            engine.discard_dead_letter(id)?;
            println!("Discarded {}", id);
        }

        Commands::Export { output } => {
            let snapshot = engine.export_snapshot();
            let content = serde_json::to_string_pretty(&snapshot)?;
            if output == "-" {
                println!("{}", content);
            } else {
                std::fs::write(&output, content)?;
                let records: usize = snapshot.values().map(Vec::len).sum();
                println!("Exported {} records to {}", records, output);
            }
        }

        Commands::Import { inputs } => {
            let mut snapshots = Vec::with_capacity(inputs.len());
            for input in &inputs {
                let content = std::fs::read_to_string(input)
                    .with_context(|| format!("reading {}", input.display()))?;
                let value = parse_backup(&content)
                    .with_context(|| format!("parsing {}", input.display()))?;
                if let Some(format) = detect_format(&value) {
                    tracing::info!("{} looks like a {} backup", input.display(), format);
                }
                let snapshot = normalize_backup(value)
                    .with_context(|| format!("normalizing {}", input.display()))?;
                snapshots.push(snapshot);
            }
            let imported = engine.import_backup(merge_backups(snapshots))?;
            println!("Imported {} records", imported);
        }

        Commands::Watch { table } => {
            require_remote()?;
            let filter = EventFilter {
                tables: (!table.is_empty()).then_some(table),
                sources: None,
            };

            let statuses = engine.status_stream().map(WatchItem::Status);
            let events = engine.cache_event_stream(filter).map(WatchItem::Event);
            let merged = futures::stream::select(statuses, events);
            tokio::pin!(merged);

            engine.init().await;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    item = merged.next() => match item {
                        Some(WatchItem::Status(status)) => {
                            if cli.json {
                                print_json(&status)?;
                            } else {
                                print_status(&status);
                            }
                        }
                        Some(WatchItem::Event(event)) => {
                            if cli.json {
                                print_json(&event)?;
                            } else {
                                print_event(&event);
                            }
                        }
                        None => break,
                    },
                }
            }

            engine.shutdown().await;
        }
    }

    Ok(())
}
