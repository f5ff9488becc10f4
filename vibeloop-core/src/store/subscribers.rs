//! Subscription fan-out shared by store implementations

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{paths, DocumentChange};

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Subscriber {
    path: String,
    tx: mpsc::UnboundedSender<DocumentChange>,
}

impl Subscriber {
    /// A document subscription sees its own document; a collection
    /// subscription sees the documents directly inside it
    fn matches(&self, changed_path: &str) -> bool {
        changed_path == self.path || paths::parent(changed_path) == Some(self.path.as_str())
    }
}

/// Routes document changes to the subscriptions watching them
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription on `path`, queueing `initial` changes first
    pub fn subscribe(&self, path: &str, initial: Vec<DocumentChange>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for change in initial {
            let _ = tx.send(change);
        }

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                path: path.to_string(),
                tx,
            },
        );

        Subscription {
            id,
            path: path.to_string(),
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a change to every matching subscriber, forgetting closed ones
    pub fn dispatch(&self, change: &DocumentChange) {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|_, sub| {
            if !sub.matches(&change.path) {
                return true;
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// A live stream of changes; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    path: String,
    rx: mpsc::UnboundedReceiver<DocumentChange>,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Subscription {
    /// Wait for the next change; `None` once the store has gone away
    pub async fn recv(&mut self) -> Option<DocumentChange> {
        self.rx.recv().await
    }

    /// Take a change if one is already queued
    pub fn try_recv(&mut self) -> Option<DocumentChange> {
        self.rx.try_recv().ok()
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().subscribers.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}
