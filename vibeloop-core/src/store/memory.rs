//! In-process document store
//!
//! Commits are applied under one lock and dispatched before the lock is
//! released, so every subscriber sees commits in the order they happened.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{paths, Document, DocumentChange, DocumentStore, FieldUpdates, StoreError, Subscription, SubscriberRegistry};
use crate::clock::{system_clock, SharedClock};

#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming writes that will fail
    failing_writes: u32,
    /// Fail every operation, reads included
    offline: bool,
}

/// A document store kept in memory
pub struct MemoryStore {
    docs: Mutex<BTreeMap<String, Document>>,
    subscribers: SubscriberRegistry,
    clock: SharedClock,
    faults: Mutex<Faults>,
    next_auto_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a store whose server timestamps come from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            docs: Mutex::new(BTreeMap::new()),
            subscribers: SubscriberRegistry::new(),
            clock,
            faults: Mutex::new(Faults::default()),
            next_auto_id: AtomicU64::new(1),
        }
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`]
    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().failing_writes = count;
    }

    /// Fail every operation until switched back on
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Number of documents currently stored
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.faults.lock().offline {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn check_write(&self, path: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        if faults.failing_writes > 0 {
            faults.failing_writes -= 1;
            debug!("MemoryStore: injected write failure for {}", path);
            return Err(StoreError::Unavailable(format!("write to {} rejected", path)));
        }
        Ok(())
    }

    fn children<'a>(
        docs: &'a BTreeMap<String, Document>,
        collection: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Document)> + 'a {
        docs.iter()
            .filter(move |(path, _)| paths::parent(path) == Some(collection))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        self.check_read()?;
        Ok(self.docs.lock().get(path).cloned())
    }

    async fn set(&self, path: &str, document: Document) -> Result<(), StoreError> {
        self.check_write(path)?;
        let mut docs = self.docs.lock();
        docs.insert(path.to_string(), document.clone());
        self.subscribers.dispatch(&DocumentChange {
            path: path.to_string(),
            document: Some(document),
        });
        Ok(())
    }

    async fn update(&self, path: &str, updates: FieldUpdates) -> Result<(), StoreError> {
        self.check_write(path)?;
        let now_ms = self.clock.now_ms();
        let mut docs = self.docs.lock();
        let doc = docs
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        updates.apply_to(doc, now_ms);
        let snapshot = doc.clone();
        self.subscribers.dispatch(&DocumentChange {
            path: path.to_string(),
            document: Some(snapshot),
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.check_write(path)?;
        let mut docs = self.docs.lock();
        if docs.remove(path).is_some() {
            self.subscribers.dispatch(&DocumentChange {
                path: path.to_string(),
                document: None,
            });
        }
        Ok(())
    }

    async fn add(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        // Zero-padded so path order matches insertion order
        let id = format!("{:012}", self.next_auto_id.fetch_add(1, Ordering::SeqCst));
        let path = format!("{}/{}", collection, id);
        self.set(&path, document).await?;
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        self.check_read()?;
        let docs = self.docs.lock();
        Ok(Self::children(&docs, collection)
            .map(|(path, doc)| (path.clone(), doc.clone()))
            .collect())
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        self.check_read()?;
        // Hold the lock while registering so no commit slips in between the
        // initial snapshot and the first live change
        let docs = self.docs.lock();
        let initial: Vec<DocumentChange> = if paths::is_collection(path) {
            Self::children(&docs, path)
                .map(|(child, doc)| DocumentChange {
                    path: child.clone(),
                    document: Some(doc.clone()),
                })
                .collect()
        } else {
            vec![DocumentChange {
                path: path.to_string(),
                document: docs.get(path).cloned(),
            }]
        };
        Ok(self.subscribers.subscribe(path, initial))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("sessions/s1", doc(json!({ "id": "s1" }))).await.unwrap();
        assert_eq!(store.get("sessions/s1").await.unwrap(), Some(doc(json!({ "id": "s1" }))));

        store.delete("sessions/s1").await.unwrap();
        assert_eq!(store.get("sessions/s1").await.unwrap(), None);

        // Deleting again is fine
        store.delete("sessions/s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_document_fails() {
        let store = MemoryStore::new();
        let err = store
            .update("sessions/nope", FieldUpdates::new().set("isPlaying", true))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("sessions/nope".to_string()));
    }

    #[tokio::test]
    async fn test_server_timestamp_comes_from_store_clock() {
        let (clock, shared) = ManualClock::shared(10_000);
        let store = MemoryStore::with_clock(shared);
        store.set("sessions/s1", Document::new()).await.unwrap();
        clock.set(12_345);
        store
            .update("sessions/s1", FieldUpdates::new().server_timestamp("heartbeatAt"))
            .await
            .unwrap();
        let d = store.get("sessions/s1").await.unwrap().unwrap();
        assert_eq!(d["heartbeatAt"], json!(12_345));
    }

    #[tokio::test]
    async fn test_injected_failures_leave_documents_untouched() {
        let store = MemoryStore::new();
        store.set("sessions/s1", doc(json!({ "isPlaying": false }))).await.unwrap();

        store.fail_next_writes(1);
        let result = store
            .update("sessions/s1", FieldUpdates::new().set("isPlaying", true))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        let d = store.get("sessions/s1").await.unwrap().unwrap();
        assert_eq!(d["isPlaying"], json!(false));

        // Only one write was poisoned
        store
            .update("sessions/s1", FieldUpdates::new().set("isPlaying", true))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_document_subscription_delivers_current_then_commits_in_order() {
        let store = MemoryStore::new();
        store.set("sessions/s1", doc(json!({ "n": 0 }))).await.unwrap();

        let mut sub = store.subscribe("sessions/s1").unwrap();
        for n in 1..=3 {
            store
                .update("sessions/s1", FieldUpdates::new().set("n", n))
                .await
                .unwrap();
        }
        store.delete("sessions/s1").await.unwrap();

        let mut seen = Vec::new();
        while let Some(change) = sub.try_recv() {
            seen.push(change.document.map(|d| d["n"].clone()));
        }
        assert_eq!(
            seen,
            vec![Some(json!(0)), Some(json!(1)), Some(json!(2)), Some(json!(3)), None]
        );
    }

    #[tokio::test]
    async fn test_subscribing_to_missing_document_reports_absence() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("sessions/ghost").unwrap();
        let first = sub.try_recv().unwrap();
        assert_eq!(first.path, "sessions/ghost");
        assert!(first.document.is_none());
    }

    #[tokio::test]
    async fn test_collection_add_list_and_subscribe() {
        let store = MemoryStore::new();
        let first = store.add("sessions/s1/chat", doc(json!({ "text": "hi" }))).await.unwrap();
        let mut sub = store.subscribe("sessions/s1/chat").unwrap();
        let second = store.add("sessions/s1/chat", doc(json!({ "text": "yo" }))).await.unwrap();
        assert!(first < second);

        let listed = store.list("sessions/s1/chat").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, format!("sessions/s1/chat/{}", first));

        assert_eq!(sub.try_recv().map(|c| c.path), Some(format!("sessions/s1/chat/{}", first)));
        assert_eq!(sub.try_recv().map(|c| c.path), Some(format!("sessions/s1/chat/{}", second)));
    }

    #[tokio::test]
    async fn test_offline_store_rejects_reads() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.get("sessions/s1").await.is_err());
        assert!(store.subscribe("sessions/s1").is_err());
        store.set_offline(false);
        assert!(store.get("sessions/s1").await.is_ok());
    }
}
