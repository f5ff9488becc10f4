//! Adapters from the FFI callback interfaces to the core traits

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::drift::AudioOutput;
use crate::store::{
    paths, Document, DocumentChange, DocumentStore, FieldUpdates, StoreError, SubscriberRegistry,
    Subscription,
};
use crate::sync::TrackRef;

use super::types::{AudioBridge, StoreBridge, Track};

fn parse_document(path: &str, json: &str) -> Result<Document, StoreError> {
    match serde_json::from_str(json) {
        Ok(serde_json::Value::Object(doc)) => Ok(doc),
        Ok(_) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: "not a JSON object".to_string(),
        }),
        Err(e) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn encode<T: serde::Serialize>(path: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// A [`DocumentStore`] backed by a foreign store
///
/// Bridge calls are blocking on the foreign side, so they run on tokio's
/// blocking pool. Subscription events come back in through
/// [`ForeignStore::notify_document_changed`].
pub struct ForeignStore {
    bridge: Arc<dyn StoreBridge>,
    subscribers: SubscriberRegistry,
}

impl ForeignStore {
    pub fn new(bridge: Arc<dyn StoreBridge>) -> Self {
        Self {
            bridge,
            subscribers: SubscriberRegistry::new(),
        }
    }

    /// Route a change pushed by the foreign store to local subscriptions
    pub fn notify_document_changed(&self, path: &str, json: Option<&str>) -> Result<(), StoreError> {
        let document = json.map(|j| parse_document(path, j)).transpose()?;
        self.subscribers.dispatch(&DocumentChange {
            path: path.to_string(),
            document,
        });
        Ok(())
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StoreBridge) -> Result<T, StoreError> + Send + 'static,
    {
        let bridge = self.bridge.clone();
        tokio::task::spawn_blocking(move || f(bridge.as_ref()))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store call aborted: {}", e)))?
    }
}

#[async_trait]
impl DocumentStore for ForeignStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let path = path.to_string();
        self.call(move |bridge| {
            bridge
                .get(path.clone())?
                .map(|json| parse_document(&path, &json))
                .transpose()
        })
        .await
    }

    async fn set(&self, path: &str, document: Document) -> Result<(), StoreError> {
        let path = path.to_string();
        let json = encode(&path, &document)?;
        self.call(move |bridge| Ok(bridge.set(path, json)?)).await
    }

    async fn update(&self, path: &str, updates: FieldUpdates) -> Result<(), StoreError> {
        let path = path.to_string();
        let json = encode(&path, &updates)?;
        self.call(move |bridge| Ok(bridge.update(path, json)?)).await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let path = path.to_string();
        self.call(move |bridge| Ok(bridge.delete(path)?)).await
    }

    async fn add(&self, collection: &str, document: Document) -> Result<String, StoreError> {
        let collection = collection.to_string();
        let json = encode(&collection, &document)?;
        self.call(move |bridge| Ok(bridge.add(collection, json)?)).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let collection = collection.to_string();
        self.call(move |bridge| {
            let mut docs = Vec::new();
            for stored in bridge.list(collection.clone())? {
                if paths::parent(&stored.path) != Some(collection.as_str()) {
                    debug!("ForeignStore: {} is not in {}", stored.path, collection);
                    continue;
                }
                let doc = parse_document(&stored.path, &stored.json)?;
                docs.push((stored.path, doc));
            }
            docs.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(docs)
        })
        .await
    }

    fn subscribe(&self, path: &str) -> Result<Subscription, StoreError> {
        let subscription = self.subscribers.subscribe(path, Vec::new());
        if let Err(e) = self.bridge.watch(path.to_string()) {
            warn!("ForeignStore: failed to watch {}: {}", path, e);
            return Err(e.into());
        }
        Ok(subscription)
    }
}

/// An [`AudioOutput`] backed by the platform audio element
pub struct ForeignAudio {
    bridge: Arc<dyn AudioBridge>,
}

impl ForeignAudio {
    pub fn new(bridge: Arc<dyn AudioBridge>) -> Self {
        Self { bridge }
    }
}

impl AudioOutput for ForeignAudio {
    fn current_time(&self) -> f64 {
        self.bridge.current_time()
    }

    fn is_playing(&self) -> bool {
        self.bridge.is_playing()
    }

    fn play(&self) {
        self.bridge.play()
    }

    fn pause(&self) {
        self.bridge.pause()
    }

    fn seek_to(&self, seconds: f64) {
        self.bridge.seek_to(seconds)
    }

    fn load(&self, track: &TrackRef) {
        self.bridge.load(Track::from(track.clone()))
    }
}
