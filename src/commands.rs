// ABOUTME: CLI subcommands for larder and the engine selection they share.
// ABOUTME: Writes go through the autosave queue; backups go through the codec and atomic file IO.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use larder_core::backup::{ImportOptions, MergeStrategy};
use larder_core::clock::SystemClock;
use larder_core::connectivity::ConnectivityMonitor;
use larder_core::operation::Operation;
use larder_core::queue::WriteQueue;
use larder_core::record::RecordKind;
use larder_store::{
    BackupCodec, LegacyMigration, MemoryEngine, RecordStore, RecordWriter, SqliteEngine,
    StorageEngine, StoreError, read_backup_file, write_backup_file,
};
use serde_json::Value;

use crate::config::{Backend, LarderConfig};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the backend, schema version, and record counts.
    Status,
    /// Print records of one kind as JSON.
    List {
        #[arg(value_parser = parse_kind)]
        kind: RecordKind,
        /// Only the N most recently modified records.
        #[arg(long)]
        recent: Option<usize>,
    },
    /// Save a record through the autosave queue.
    Save {
        #[arg(value_parser = parse_kind)]
        kind: RecordKind,
        /// Record fields as a JSON object.
        json: String,
        /// Explicit id; otherwise one is derived from the record.
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete a record through the autosave queue.
    Delete {
        #[arg(value_parser = parse_kind)]
        kind: RecordKind,
        id: String,
    },
    /// Write every record to a backup file.
    Export { path: PathBuf },
    /// Merge a backup file into the store.
    Import {
        path: PathBuf,
        /// `keep-newer` or `overwrite`.
        #[arg(long, default_value = "keep-newer")]
        strategy: MergeStrategy,
    },
    /// Merge profiles kept under deprecated settings keys.
    MigrateLegacy,
}

fn parse_kind(raw: &str) -> Result<RecordKind, String> {
    match raw.to_ascii_lowercase().as_str() {
        "profile" | "profiles" => Ok(RecordKind::Profile),
        "project" | "projects" => Ok(RecordKind::Project),
        "setting" | "settings" => Ok(RecordKind::Setting),
        other => Err(format!("unknown record kind: {}", other)),
    }
}

/// Pick the configured engine. An unusable SQLite file degrades to an
/// in-memory store so the command still runs.
pub async fn open_engine(config: &LarderConfig) -> anyhow::Result<Arc<dyn StorageEngine>> {
    match config.backend {
        Backend::Memory => Ok(Arc::new(MemoryEngine::default())),
        Backend::Sqlite => {
            let engine = SqliteEngine::with_default_schema(config.db_path());
            match engine.open().await {
                Ok(handle) => {
                    handle.close().await?;
                    Ok(Arc::new(engine))
                }
                Err(StoreError::EngineUnavailable(reason)) => {
                    tracing::warn!(
                        reason = %reason,
                        "sqlite unavailable, falling back to an in-memory store; nothing will be kept"
                    );
                    Ok(Arc::new(MemoryEngine::default()))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

pub async fn run(command: Command, config: &LarderConfig) -> anyhow::Result<()> {
    let engine = open_engine(config).await?;
    tracing::debug!(engine = engine.name(), "storage engine ready");
    let store = RecordStore::new(engine, Arc::new(SystemClock));

    match command {
        Command::Status => status(&store).await,
        Command::List { kind, recent } => list(&store, kind, recent).await,
        Command::Save { kind, json, id } => save(&store, config, kind, &json, id).await,
        Command::Delete { kind, id } => {
            autosave(&store, config, Operation::delete(kind.collection(), id.as_str())).await?;
            println!("deleted {} {}", kind.collection(), id);
            Ok(())
        }
        Command::Export { path } => export(&store, &path).await,
        Command::Import { path, strategy } => import(&store, &path, strategy).await,
        Command::MigrateLegacy => migrate_legacy(&store).await,
    }
}

async fn status(store: &RecordStore) -> anyhow::Result<()> {
    let handle = store.engine().open().await?;
    let version = handle.schema_version();
    handle.close().await?;

    println!("engine: {}", store.engine().name());
    println!("schema version: {}", version);
    for kind in RecordKind::ALL {
        let count = store.list(kind).await?.len();
        println!("{}: {}", kind.collection(), count);
    }
    Ok(())
}

async fn list(store: &RecordStore, kind: RecordKind, recent: Option<usize>) -> anyhow::Result<()> {
    let records = match recent {
        Some(limit) => store.recent(kind, limit).await?,
        None => store.list(kind).await?,
    };
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

async fn save(
    store: &RecordStore,
    config: &LarderConfig,
    kind: RecordKind,
    json: &str,
    id: Option<String>,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(json).context("record must be valid JSON")?;
    anyhow::ensure!(payload.is_object(), "record must be a JSON object");

    // Settle the id up front so it can be reported back.
    let id = id.unwrap_or_else(|| store.normalize(kind, &payload).id);
    autosave(store, config, Operation::upsert(kind.collection(), id.as_str(), payload)).await?;
    println!("saved {} {}", kind.collection(), id);
    Ok(())
}

/// Push one operation through a short-lived write queue and flush it.
async fn autosave(store: &RecordStore, config: &LarderConfig, op: Operation) -> anyhow::Result<()> {
    let queue = WriteQueue::new(
        config.autosave.clone(),
        Arc::new(ConnectivityMonitor::online()),
        Arc::new(RecordWriter::from_store(store)),
    );
    queue.queue(op);
    let result = queue.flush().await;
    queue.dispose();
    Ok(result?)
}

async fn export(store: &RecordStore, path: &Path) -> anyhow::Result<()> {
    let payload = BackupCodec::from_store(store).export_backup().await?;
    write_backup_file(path, &payload)
        .with_context(|| format!("failed to write backup to {}", path.display()))?;
    println!("exported {} record(s) to {}", payload.record_count(), path.display());
    Ok(())
}

async fn import(store: &RecordStore, path: &Path, strategy: MergeStrategy) -> anyhow::Result<()> {
    let payload = read_backup_file(path)
        .with_context(|| format!("failed to read backup from {}", path.display()))?;
    let report = BackupCodec::from_store(store)
        .import_backup(payload, ImportOptions { merge_strategy: strategy })
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn migrate_legacy(store: &RecordStore) -> anyhow::Result<()> {
    match store.migrate_legacy().await? {
        LegacyMigration::AlreadyDone => println!("legacy migration already ran"),
        LegacyMigration::NothingToMigrate => println!("no legacy profiles found"),
        LegacyMigration::Migrated { merged, kept_existing } => {
            println!("merged {} profile(s), kept {} newer existing", merged, kept_existing)
        }
    }
    Ok(())
}
