// ABOUTME: In-memory storage engine, used for tests and when no durable backend can be opened.
// ABOUTME: Migrations run against a draft copy that only replaces the live data once every step succeeds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::{
    CollectionSpec, IndexSpec, ListOptions, Mutation, SchemaEditor, StorageEngine, StoreError,
    StoreHandle, compare_keys, extract_key,
};
use crate::migration::Migrator;

#[derive(Debug, Clone, Default)]
struct MemoryCollection {
    /// Index name to key path.
    indexes: BTreeMap<String, String>,
    rows: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
struct MemoryDb {
    version: u32,
    collections: BTreeMap<String, MemoryCollection>,
}

impl MemoryDb {
    fn collection(&self, name: &str) -> Result<&MemoryCollection, StoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut MemoryCollection, StoreError> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownCollection(name.to_string()))
    }
}

/// A storage engine that keeps everything in process memory. Clones share
/// the same data.
#[derive(Clone)]
pub struct MemoryEngine {
    db: Arc<Mutex<MemoryDb>>,
    migrator: Arc<Migrator>,
}

impl MemoryEngine {
    pub fn new(migrator: Migrator) -> Self {
        Self {
            db: Arc::new(Mutex::new(MemoryDb::default())),
            migrator: Arc::new(migrator),
        }
    }

    /// An empty engine that migrates to the current larder schema on open.
    pub fn with_default_schema() -> Self {
        Self::new(Migrator::default())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::with_default_schema()
    }
}

fn lock(db: &Mutex<MemoryDb>) -> MutexGuard<'_, MemoryDb> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open(&self) -> Result<Box<dyn StoreHandle>, StoreError> {
        let mut db = lock(&self.db);
        let target = self.migrator.current_version();

        if db.version < target {
            let mut draft = db.clone();
            let old_version = draft.version;
            let applied = self
                .migrator
                .upgrade(&mut MemoryEditor { db: &mut draft }, old_version)?;
            draft.version = applied;
            *db = draft;
            tracing::debug!(from = old_version, to = applied, "memory store upgraded");
        }

        Ok(Box::new(MemoryHandle {
            db: Arc::clone(&self.db),
            version: db.version,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryEditor<'a> {
    db: &'a mut MemoryDb,
}

impl SchemaEditor for MemoryEditor<'_> {
    fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.db.collections.contains_key(name))
    }

    fn create_collection(&mut self, spec: &CollectionSpec) -> Result<(), StoreError> {
        let collection = MemoryCollection {
            indexes: spec
                .indexes
                .iter()
                .map(|index| (index.name.clone(), index.key_path.clone()))
                .collect(),
            rows: BTreeMap::new(),
        };
        self.db.collections.insert(spec.name.clone(), collection);
        Ok(())
    }

    fn has_index(&self, collection: &str, index: &str) -> Result<bool, StoreError> {
        Ok(self.db.collection(collection)?.indexes.contains_key(index))
    }

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        self.db
            .collection_mut(collection)?
            .indexes
            .insert(index.name.clone(), index.key_path.clone());
        Ok(())
    }

    fn delete_collection(&mut self, name: &str) -> Result<(), StoreError> {
        self.db.collections.remove(name);
        Ok(())
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.db.collection(collection)?.rows.values().cloned().collect())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.db.collection(collection)?.rows.get(id).cloned())
    }

    fn put(&mut self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        self.db
            .collection_mut(collection)?
            .rows
            .insert(id.to_string(), value);
        Ok(())
    }
}

struct MemoryHandle {
    db: Arc<Mutex<MemoryDb>>,
    version: u32,
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    fn schema_version(&self) -> u32 {
        self.version
    }

    async fn collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(lock(&self.db).collections.keys().cloned().collect())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(lock(&self.db).collection(collection)?.rows.get(id).cloned())
    }

    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        lock(&self.db)
            .collection_mut(collection)?
            .rows
            .insert(id.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        lock(&self.db).collection_mut(collection)?.rows.remove(id);
        Ok(())
    }

    async fn list(&self, collection: &str, options: &ListOptions) -> Result<Vec<Value>, StoreError> {
        let db = lock(&self.db);
        let table = db.collection(collection)?;

        let key_path = match options.index.as_deref() {
            Some(index) => match table.indexes.get(index) {
                Some(path) => Some(path.as_str()),
                None => {
                    tracing::debug!(collection, index, "no such index, listing by primary key");
                    None
                }
            },
            None => None,
        };

        let mut rows: Vec<(&String, &Value)> = table.rows.iter().collect();
        if let Some(path) = key_path {
            rows.sort_by(|(a_id, a), (b_id, b)| {
                compare_keys(extract_key(a, path), extract_key(b, path)).then_with(|| a_id.cmp(b_id))
            });
        }
        if options.reverse {
            rows.reverse();
        }

        let limit = options.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError> {
        let mut db = lock(&self.db);
        // Validate the whole batch before touching anything.
        for mutation in &batch {
            db.collection(mutation.collection())?;
        }

        for mutation in batch {
            match mutation {
                Mutation::Put { collection, id, value } => {
                    db.collection_mut(&collection)?.rows.insert(id, value);
                }
                Mutation::Delete { collection, id } => {
                    db.collection_mut(&collection)?.rows.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
