//! Documents, updates and response shapes.
//!
//! At the boundary a document is a JSON object `{ "_id": ..., ...fields }`;
//! a deleted document surfaces as `{ "_id": ..., "_deleted": true }`.

use crate::error::{DbError, Result};
use cinder_merkle::{Cid, ClockHead};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use ulid::Ulid;

/// The user fields of a document.
pub type Fields = Map<String, Value>;

/// Generate a new globally unique, time-sortable document key.
pub fn new_doc_id() -> String {
    Ulid::new().to_string()
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A document as seen by callers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Empty means "not assigned yet"; `put` generates one.
    #[serde(rename = "_id", default)]
    pub id: String,

    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(flatten)]
    pub fields: Fields,
}

/// Short alias used throughout the API.
pub type Doc = Document;

impl Document {
    /// A document without an id.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            ..Self::default()
        }
    }

    /// The deletion marker for `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            deleted: true,
            fields: Fields::new(),
        }
    }

    /// Builder-style field setter.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Parse a boundary-shaped JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(DbError::Serialization(format!(
                "document must be a JSON object, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert("_id".to_string(), Value::String(self.id.clone()));
        if self.deleted {
            object.insert("_deleted".to_string(), Value::Bool(true));
        }
        Value::Object(object)
    }
}

/// One entry of a mutation batch: a new value for `key`, or a tombstone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub key: String,

    /// `None` marks a deletion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Fields>,
}

impl DocUpdate {
    pub fn put(key: impl Into<String>, value: Fields) -> Self {
        DocUpdate {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        DocUpdate {
            key: key.into(),
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    /// The document this update resolves to.
    pub fn to_doc(&self) -> Document {
        match &self.value {
            Some(fields) => Document {
                id: self.key.clone(),
                deleted: false,
                fields: fields.clone(),
            },
            None => Document::tombstone(self.key.clone()),
        }
    }
}

/// Collapse a batch so each key appears once, holding its last value.
///
/// Surviving entries keep the relative order of their final submission.
pub fn coalesce(updates: Vec<DocUpdate>) -> Vec<DocUpdate> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(updates.len());
    for (i, update) in updates.iter().enumerate() {
        last.insert(update.key.as_str(), i);
    }
    if last.len() == updates.len() {
        return updates;
    }
    let keep: Vec<bool> = updates
        .iter()
        .enumerate()
        .map(|(i, update)| last.get(update.key.as_str()) == Some(&i))
        .collect();
    updates
        .into_iter()
        .zip(keep)
        .filter_map(|(update, keep)| keep.then_some(update))
        .collect()
}

/// Acknowledgement of a write.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DbResponse {
    pub id: String,
    pub clock: ClockHead,
}

/// One changed document in a change feed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChangeRow {
    pub key: String,
    pub value: Document,
    /// The node whose write this row reflects.
    pub clock: Cid,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChangesResponse {
    pub rows: Vec<ChangeRow>,
    /// Pass back as `since` to continue from here.
    pub clock: ClockHead,
}

/// Options for `changes`.
#[derive(Clone, Debug, Default)]
pub struct ChangesOptions {
    /// Maximum rows (default: unbounded).
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DocRow {
    pub key: String,
    pub value: Document,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AllDocsResponse {
    pub rows: Vec<DocRow>,
    pub clock: ClockHead,
}
