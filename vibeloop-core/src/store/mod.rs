//! Document Store
//!
//! The durable, subscribable backbone every session is built on. Paths
//! alternate collection and document segments: `sessions/{id}` is a
//! document, `sessions/{id}/chat` is a collection of documents.

mod memory;
mod subscribers;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryStore;
pub use subscribers::{SubscriberRegistry, Subscription};

/// A stored document: a JSON object
pub type Document = serde_json::Map<String, Value>;

/// Errors surfaced by a document store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed document at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

/// A single field mutation applied by [`DocumentStore::update`]
///
/// Field names may be dotted (`participantNames.u1`) to reach into nested
/// maps without overwriting siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FieldOp {
    /// Replace the field
    Set(Value),
    /// Append values not already present in the array field
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the values from the array field
    ArrayRemove(Vec<Value>),
    /// Set the field to the store's own clock
    ServerTimestamp,
    /// Remove the field
    Delete,
}

/// A partial update: field path → operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldUpdates(BTreeMap<String, FieldOp>);

impl FieldUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), FieldOp::Set(value.into()));
        self
    }

    pub fn array_union(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.insert(field.into(), FieldOp::ArrayUnion(values));
        self
    }

    pub fn array_remove(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.0.insert(field.into(), FieldOp::ArrayRemove(values));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldOp::ServerTimestamp);
        self
    }

    pub fn delete(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), FieldOp::Delete);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldOp)> {
        self.0.iter()
    }

    /// Apply every operation to `doc`, resolving server timestamps to `now_ms`
    pub fn apply_to(&self, doc: &mut Document, now_ms: u64) {
        for (field, op) in &self.0 {
            apply_op(doc, field, op, now_ms);
        }
    }
}

fn apply_op(doc: &mut Document, field: &str, op: &FieldOp, now_ms: u64) {
    if let Some((head, rest)) = field.split_once('.') {
        let entry = doc
            .entry(head.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        if let Value::Object(nested) = entry {
            apply_op(nested, rest, op, now_ms);
        }
        return;
    }

    match op {
        FieldOp::Set(value) => {
            doc.insert(field.to_string(), value.clone());
        }
        FieldOp::ServerTimestamp => {
            doc.insert(field.to_string(), Value::from(now_ms));
        }
        FieldOp::Delete => {
            doc.remove(field);
        }
        FieldOp::ArrayUnion(values) => {
            let entry = doc
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            if let Value::Array(items) = entry {
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
            }
        }
        FieldOp::ArrayRemove(values) => {
            if let Some(Value::Array(items)) = doc.get_mut(field) {
                items.retain(|item| !values.contains(item));
            }
        }
    }
}

/// A change observed through a subscription
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Path of the document that changed
    pub path: String,
    /// The document after the change; `None` once deleted
    pub document: Option<Document>,
}

/// Durable document storage with live subscriptions
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read a document
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Create or replace a document
    async fn set(&self, path: &str, document: Document) -> Result<(), StoreError>;

    /// Merge field operations into an existing document
    ///
    /// Fails with [`StoreError::NotFound`] if the document does not exist.
    async fn update(&self, path: &str, updates: FieldUpdates) -> Result<(), StoreError>;

    /// Delete a document; deleting a missing document succeeds
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Append a document with a store-generated id to a collection
    async fn add(&self, collection: &str, document: Document) -> Result<String, StoreError>;

    /// List the documents directly inside a collection, in path order
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError>;

    /// Watch a document, or every document directly inside a collection
    ///
    /// The current state is delivered first, then every commit in the order
    /// it was applied. Dropping the subscription unsubscribes.
    fn subscribe(&self, path: &str) -> Result<Subscription, StoreError>;
}

/// Path helpers for the session layout
pub mod paths {
    pub const SESSIONS: &str = "sessions";

    pub fn session(session_id: &str) -> String {
        format!("{}/{}", SESSIONS, session_id)
    }

    pub fn chat(session_id: &str) -> String {
        format!("{}/{}/chat", SESSIONS, session_id)
    }

    pub fn chat_event(session_id: &str, event_id: &str) -> String {
        format!("{}/{}", chat(session_id), event_id)
    }

    pub fn signals(session_id: &str) -> String {
        format!("{}/{}/signals", SESSIONS, session_id)
    }

    /// Collections sit at odd depths: `sessions`, `sessions/{id}/chat`
    pub fn is_collection(path: &str) -> bool {
        path.split('/').count() % 2 == 1
    }

    /// The last segment of a path (a document's id)
    pub fn leaf(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    /// The collection a document lives in
    pub fn parent(path: &str) -> Option<&str> {
        path.rsplit_once('/').map(|(parent, _)| parent)
    }
}
