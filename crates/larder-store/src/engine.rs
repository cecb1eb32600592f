// ABOUTME: The storage engine contract: named collections with a primary key and secondary indexes.
// ABOUTME: Engines hand out scoped handles for get/put/delete/list and all-or-nothing batch commits.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors that can occur in a storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("migration to schema version {version} failed: {reason}")]
    MigrationFailed { version: u32, reason: String },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::TransactionFailed(err.to_string())
    }
}

/// A secondary index: records are ordered by the value at `key_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub key_path: String,
}

/// The declared shape of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub key_path: String,
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    pub fn new(name: &str, key_path: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: key_path.to_string(),
            indexes: Vec::new(),
        }
    }

    /// Add an index whose name equals its key path.
    pub fn index(mut self, key_path: &str) -> Self {
        self.indexes.push(IndexSpec {
            name: key_path.to_string(),
            key_path: key_path.to_string(),
        });
        self
    }
}

/// Options for `StoreHandle::list`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub index: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl ListOptions {
    pub fn by_index(index: &str) -> Self {
        Self {
            index: Some(index.to_string()),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put {
        collection: String,
        id: String,
        value: Value,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl Mutation {
    pub fn collection(&self) -> &str {
        match self {
            Mutation::Put { collection, .. } | Mutation::Delete { collection, .. } => collection,
        }
    }
}

/// A backend that can be opened into handles. Opening runs any pending
/// schema migration before the handle is returned.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn open(&self) -> Result<Box<dyn StoreHandle>, StoreError>;

    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// An open handle, owned by one logical unit of work. Resources are
/// released by `close()` or when the handle is dropped.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// The schema version the store was at once the handle opened.
    fn schema_version(&self) -> u32;

    async fn collections(&self) -> Result<Vec<String>, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// List records, ordered by `options.index` when that index exists and
    /// by primary key otherwise. `limit` applies after ordering.
    async fn list(&self, collection: &str, options: &ListOptions) -> Result<Vec<Value>, StoreError>;

    /// Apply every mutation or none of them.
    async fn commit(&self, batch: Vec<Mutation>) -> Result<(), StoreError>;

    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Structural editing available to migration steps while the engine holds
/// its upgrade transaction open.
pub trait SchemaEditor {
    fn has_collection(&self, name: &str) -> Result<bool, StoreError>;

    /// Create the collection with its declared indexes.
    fn create_collection(&mut self, spec: &CollectionSpec) -> Result<(), StoreError>;

    fn has_index(&self, collection: &str, index: &str) -> Result<bool, StoreError>;

    fn create_index(&mut self, collection: &str, index: &IndexSpec) -> Result<(), StoreError>;

    /// Remove a collection and everything in it.
    fn delete_collection(&mut self, name: &str) -> Result<(), StoreError>;

    fn read_all(&self, collection: &str) -> Result<Vec<Value>, StoreError>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    fn put(&mut self, collection: &str, id: &str, value: Value) -> Result<(), StoreError>;
}

/// Resolve a dotted key path (`data.email`) inside a JSON value.
pub fn extract_key<'a>(value: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Order two index keys: missing and null first, then booleans and numbers,
/// then strings, then composite values by their JSON text.
pub fn compare_keys(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) | Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Array(_)) | Some(Value::Object(_)) => 3,
        }
    }

    fn numeric(v: &Value) -> f64 {
        match v {
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ (Value::Bool(_) | Value::Number(_))), Some(y)) => {
            numeric(x).partial_cmp(&numeric(y)).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        _ => Ordering::Equal,
    })
}

/// Whether a collection, index, or key path name is safe to embed in SQL.
pub(crate) fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
