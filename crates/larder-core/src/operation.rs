// ABOUTME: Defines the Operation type callers hand to the autosave write queue.
// ABOUTME: An operation targets a collection, optionally names an entity, and carries an opaque payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether an operation writes or removes its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Upsert,
    Delete,
}

/// A single pending write. Operations that share an `entity_id` coalesce
/// in the queue; operations without one are kept in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub entity_id: Option<String>,
    pub collection: String,
    pub kind: OperationKind,
    pub payload: Value,
}

impl Operation {
    /// An upsert for a known entity.
    pub fn upsert(collection: impl Into<String>, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            collection: collection.into(),
            kind: OperationKind::Upsert,
            payload,
        }
    }

    /// An upsert whose identity is derived from the payload at write time.
    pub fn upsert_unkeyed(collection: impl Into<String>, payload: Value) -> Self {
        Self {
            entity_id: None,
            collection: collection.into(),
            kind: OperationKind::Upsert,
            payload,
        }
    }

    /// A delete of a known entity.
    pub fn delete(collection: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            collection: collection.into(),
            kind: OperationKind::Delete,
            payload: Value::Null,
        }
    }
}
