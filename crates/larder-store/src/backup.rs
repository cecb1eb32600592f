// ABOUTME: BackupCodec exports every tracked collection into a BackupPayload and merges payloads back in.
// ABOUTME: Imports resolve each record by keep-newer or overwrite and commit all accepted records at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use larder_core::backup::{BACKUP_VERSION, BackupPayload, ImportOptions, ImportReport, should_replace};
use larder_core::clock::Clock;
use larder_core::record::{RecordKind, normalize};
use serde_json::Value;

use crate::engine::{ListOptions, Mutation, StorageEngine, StoreError, StoreHandle};
use crate::records::RecordStore;

#[derive(Clone)]
pub struct BackupCodec {
    engine: Arc<dyn StorageEngine>,
    clock: Arc<dyn Clock>,
}

impl BackupCodec {
    pub fn new(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    /// A codec over the same engine and clock as `store`.
    pub fn from_store(store: &RecordStore) -> Self {
        Self::new(Arc::clone(store.engine()), Arc::clone(store.clock()))
    }

    /// Read every tracked collection in full.
    pub async fn export_backup(&self) -> Result<BackupPayload, StoreError> {
        let handle = self.engine.open().await?;
        let result = self.read_all(handle.as_ref()).await;
        let closed = handle.close().await;
        let payload = result?;
        closed?;

        tracing::info!(records = payload.record_count(), "backup exported");
        Ok(payload)
    }

    async fn read_all(&self, handle: &dyn StoreHandle) -> Result<BackupPayload, StoreError> {
        let mut payload = BackupPayload::new(self.clock.now());
        for kind in RecordKind::ALL {
            let rows = handle
                .list(kind.collection(), &ListOptions::default())
                .await?;
            payload.data.insert(kind.collection().to_string(), rows);
        }
        Ok(payload)
    }

    /// Merge a payload into the store. Records without a primary key and
    /// collections this build does not track are counted and skipped.
    pub async fn import_backup(
        &self,
        payload: BackupPayload,
        options: ImportOptions,
    ) -> Result<ImportReport, StoreError> {
        if payload.version > BACKUP_VERSION {
            tracing::warn!(
                version = payload.version,
                supported = BACKUP_VERSION,
                "backup was written by a newer build, importing known collections only"
            );
        }

        let handle = self.engine.open().await?;
        let result = self.merge(handle.as_ref(), payload, options).await;
        let closed = handle.close().await;
        let report = result?;
        closed?;

        tracing::info!(
            imported = report.imported,
            skipped_older = report.skipped_older,
            skipped_invalid = report.skipped_invalid,
            skipped_collections = report.skipped_collections,
            "backup imported"
        );
        Ok(report)
    }

    async fn merge(
        &self,
        handle: &dyn StoreHandle,
        payload: BackupPayload,
        options: ImportOptions,
    ) -> Result<ImportReport, StoreError> {
        let now = self.clock.now();
        let mut report = ImportReport::default();
        // Accepted records, so duplicates inside one payload compete with
        // each other rather than with the stored copy.
        let mut staged: BTreeMap<(&'static str, String), Value> = BTreeMap::new();

        for (collection, records) in payload.data {
            let Some(kind) = RecordKind::from_collection(&collection) else {
                tracing::warn!(collection = %collection, records = records.len(), "skipping unknown collection");
                report.skipped_collections += 1;
                continue;
            };
            let name = kind.collection();

            for raw in records {
                let Some(id) = kind.primary_key(&raw) else {
                    tracing::warn!(collection = name, "skipping record without a primary key");
                    report.skipped_invalid += 1;
                    continue;
                };

                let key = (name, id);
                let existing = match staged.get(&key) {
                    Some(value) => Some(value.clone()),
                    None => handle.get(name, &key.1).await?,
                };
                if !should_replace(options.merge_strategy, &raw, existing.as_ref()) {
                    tracing::debug!(collection = name, id = %key.1, "incoming record is older, keeping existing");
                    report.skipped_older += 1;
                    continue;
                }

                let record = normalize(kind, &raw, now);
                staged.insert(key, record.to_value()?);
            }
        }

        report.imported = staged.len();
        let batch = staged
            .into_iter()
            .map(|((collection, id), value)| Mutation::Put {
                collection: collection.to_string(),
                id,
                value,
            })
            .collect();
        handle.commit(batch).await?;
        Ok(report)
    }
}
