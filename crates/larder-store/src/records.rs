// ABOUTME: RecordStore: typed reads and writes of profiles, projects, and settings over a storage engine.
// ABOUTME: Also runs the one-shot merge of profiles kept under deprecated settings keys into the profiles store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use larder_core::backup::{MergeStrategy, should_replace};
use larder_core::clock::Clock;
use larder_core::record::{self, RecordKind, StoredRecord};
use serde_json::{Map, Value};

use crate::engine::{ListOptions, Mutation, StorageEngine, StoreError, StoreHandle};

/// Settings key under which builds with a single profile kept it.
pub const LEGACY_PROFILE_SETTING: &str = "legacy.profile";

/// Settings key under which early multi-profile builds kept a profile list.
pub const LEGACY_PROFILES_SETTING: &str = "legacy.profiles";

/// Outcome of `RecordStore::migrate_legacy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyMigration {
    /// This store already ran (or is running) the migration.
    AlreadyDone,
    /// No legacy keys were present.
    NothingToMigrate,
    Migrated { merged: usize, kept_existing: usize },
}

/// Typed record access over a storage engine. Every call opens its own
/// handle and closes it before returning.
#[derive(Clone)]
pub struct RecordStore {
    engine: Arc<dyn StorageEngine>,
    clock: Arc<dyn Clock>,
    /// Set once `migrate_legacy` starts; shared by clones of this store only.
    legacy_started: Arc<AtomicBool>,
}

impl RecordStore {
    pub fn new(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            legacy_started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Canonicalize raw input against this store's clock.
    pub fn normalize(&self, kind: RecordKind, raw: &Value) -> StoredRecord {
        record::normalize(kind, raw, self.clock.now())
    }

    pub fn derive_id(&self, kind: RecordKind, data: &Map<String, Value>, provided: Option<&str>) -> String {
        record::derive_id(kind, data, provided)
    }

    pub async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<StoredRecord>, StoreError> {
        let handle = self.engine.open().await?;
        let result = handle.get(kind.collection(), id).await;
        let raw = finish(handle, result).await?;
        Ok(raw.map(|raw| self.normalize(kind, &raw)))
    }

    /// Normalize and write a record, stamping it as modified now.
    pub async fn save(&self, kind: RecordKind, raw: &Value) -> Result<StoredRecord, StoreError> {
        let mut record = self.normalize(kind, raw);
        record.touch(self.clock.now());
        let value = record.to_value()?;

        let handle = self.engine.open().await?;
        let result = handle.put(kind.collection(), &record.id, value).await;
        finish(handle, result).await?;

        tracing::debug!(collection = kind.collection(), id = %record.id, "record saved");
        Ok(record)
    }

    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let handle = self.engine.open().await?;
        let result = handle.delete(kind.collection(), id).await;
        finish(handle, result).await
    }

    /// Every record of `kind`, in id order.
    pub async fn list(&self, kind: RecordKind) -> Result<Vec<StoredRecord>, StoreError> {
        self.list_with(kind, &ListOptions::default()).await
    }

    /// The `limit` most recently modified records of `kind`, newest first.
    pub async fn recent(&self, kind: RecordKind, limit: usize) -> Result<Vec<StoredRecord>, StoreError> {
        self.list_with(kind, &ListOptions::by_index("updatedAt").reverse().limit(limit))
            .await
    }

    async fn list_with(&self, kind: RecordKind, options: &ListOptions) -> Result<Vec<StoredRecord>, StoreError> {
        let handle = self.engine.open().await?;
        let result = handle.list(kind.collection(), options).await;
        let rows = finish(handle, result).await?;
        Ok(rows.iter().map(|raw| self.normalize(kind, raw)).collect())
    }

    /// Merge profiles kept under deprecated settings keys into the
    /// profiles collection, newest `updatedAt` winning, and remove the old
    /// keys in the same commit. Runs at most once per store; a failed run
    /// may be retried.
    pub async fn migrate_legacy(&self) -> Result<LegacyMigration, StoreError> {
        if self
            .legacy_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(LegacyMigration::AlreadyDone);
        }

        let outcome = match self.engine.open().await {
            Ok(handle) => {
                let result = self.merge_legacy(handle.as_ref()).await;
                finish(handle, result).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(outcome) => {
                tracing::info!(?outcome, "legacy profile migration finished");
                Ok(outcome)
            }
            Err(err) => {
                self.legacy_started.store(false, Ordering::Release);
                tracing::warn!(error = %err, "legacy profile migration failed, will retry on next call");
                Err(err)
            }
        }
    }

    async fn merge_legacy(&self, handle: &dyn StoreHandle) -> Result<LegacyMigration, StoreError> {
        let settings = RecordKind::Setting.collection();
        let profiles = RecordKind::Profile.collection();

        let mut present = Vec::new();
        let mut candidates = Vec::new();
        for key in [LEGACY_PROFILE_SETTING, LEGACY_PROFILES_SETTING] {
            if let Some(row) = handle.get(settings, key).await? {
                present.push(key);
                candidates.extend(legacy_profiles(key, &row));
            }
        }
        if present.is_empty() {
            return Ok(LegacyMigration::NothingToMigrate);
        }

        let now = self.clock.now();
        let mut staged: BTreeMap<String, Value> = BTreeMap::new();
        let mut kept_existing = 0usize;
        for raw in candidates {
            let record = record::normalize(RecordKind::Profile, &raw, now);
            let existing = match staged.get(&record.id) {
                Some(value) => Some(value.clone()),
                None => handle.get(profiles, &record.id).await?,
            };
            if !should_replace(MergeStrategy::KeepNewer, &raw, existing.as_ref()) {
                kept_existing += 1;
                continue;
            }
            staged.insert(record.id.clone(), record.to_value()?);
        }

        let merged = staged.len();
        let mut batch: Vec<Mutation> = staged
            .into_iter()
            .map(|(id, value)| Mutation::Put {
                collection: profiles.to_string(),
                id,
                value,
            })
            .collect();
        batch.extend(present.into_iter().map(|key| Mutation::Delete {
            collection: settings.to_string(),
            id: key.to_string(),
        }));
        handle.commit(batch).await?;

        Ok(LegacyMigration::Migrated { merged, kept_existing })
    }
}

/// Pull profile objects out of a legacy settings row. The value may be an
/// object, an array of objects, or either one encoded as a JSON string.
fn legacy_profiles(key: &str, row: &Value) -> Vec<Value> {
    let stored = row
        .get("data")
        .and_then(|data| data.get("value"))
        .or_else(|| row.get("value"))
        .cloned()
        .unwrap_or(Value::Null);

    let value = match stored {
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(key, error = %err, "legacy setting is not valid JSON, skipping");
                return Vec::new();
            }
        },
        other => other,
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    };
    items.into_iter().filter(Value::is_object).collect()
}

/// Close the handle on every path, preferring the operation's own error.
async fn finish<T>(handle: Box<dyn StoreHandle>, result: Result<T, StoreError>) -> Result<T, StoreError> {
    let closed = handle.close().await;
    let value = result?;
    closed?;
    Ok(value)
}
