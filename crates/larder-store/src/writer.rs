// ABOUTME: RecordWriter persists autosave batches: each operation becomes a mutation in one atomic commit.
// ABOUTME: Upserts are normalized and stamped with the clock; deletes need an entity id.

use std::sync::Arc;

use async_trait::async_trait;
use larder_core::clock::Clock;
use larder_core::operation::{Operation, OperationKind};
use larder_core::queue::{PersistBatch, PersistError};
use larder_core::record::{RecordKind, normalize};

use crate::engine::{Mutation, StorageEngine, StoreError};
use crate::records::RecordStore;

/// The persistence function handed to a `WriteQueue`.
#[derive(Clone)]
pub struct RecordWriter {
    engine: Arc<dyn StorageEngine>,
    clock: Arc<dyn Clock>,
}

impl RecordWriter {
    pub fn new(engine: Arc<dyn StorageEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn from_store(store: &RecordStore) -> Self {
        Self::new(Arc::clone(store.engine()), Arc::clone(store.clock()))
    }

    fn to_mutation(&self, op: Operation) -> Result<Option<Mutation>, StoreError> {
        let kind = RecordKind::from_collection(&op.collection)
            .ok_or_else(|| StoreError::UnknownCollection(op.collection.clone()))?;

        match op.kind {
            OperationKind::Upsert => {
                let now = self.clock.now();
                let mut record = normalize(kind, &op.payload, now);
                if let Some(id) = op.entity_id {
                    record.id = id;
                }
                record.touch(now);
                Ok(Some(Mutation::Put {
                    collection: op.collection,
                    id: record.id.clone(),
                    value: record.to_value()?,
                }))
            }
            OperationKind::Delete => match op.entity_id {
                Some(id) => Ok(Some(Mutation::Delete {
                    collection: op.collection,
                    id,
                })),
                None => {
                    tracing::warn!(collection = %op.collection, "delete without an entity id, skipping");
                    Ok(None)
                }
            },
        }
    }

    /// Apply one batch atomically.
    pub async fn write(&self, batch: Vec<Operation>) -> Result<(), StoreError> {
        let mut mutations = Vec::with_capacity(batch.len());
        for op in batch {
            if let Some(mutation) = self.to_mutation(op)? {
                mutations.push(mutation);
            }
        }
        if mutations.is_empty() {
            return Ok(());
        }

        let count = mutations.len();
        let handle = self.engine.open().await?;
        let result = handle.commit(mutations).await;
        let closed = handle.close().await;
        result?;
        closed?;

        tracing::debug!(count, "autosave batch committed");
        Ok(())
    }
}

#[async_trait]
impl PersistBatch for RecordWriter {
    async fn persist(&self, batch: Vec<Operation>) -> Result<(), PersistError> {
        self.write(batch).await.map_err(PersistError::from)
    }
}
