//! Signaling over the document store
//!
//! Negotiation payloads ride in `sessions/{id}/signals` as small envelopes
//! addressed from one participant to another. The store delivers them
//! reliably and in commit order, which is all a transport needs.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::store::{paths, Document, DocumentStore, StoreError, Subscription};

/// One signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    /// Opaque to everything but the transport
    pub payload: String,
    pub sent_at: u64,
}

impl SignalEnvelope {
    fn to_document(&self) -> Result<Document, StoreError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(doc)) => Ok(doc),
            _ => Err(StoreError::Malformed {
                path: String::new(),
                reason: "signal envelope did not serialize to an object".to_string(),
            }),
        }
    }

    fn from_document(doc: Document) -> Option<Self> {
        serde_json::from_value(serde_json::Value::Object(doc)).ok()
    }
}

/// Signaling endpoint of one participant in one session
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn DocumentStore>,
    collection: String,
    local_id: String,
    clock: SharedClock,
}

impl SignalingChannel {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session_id: &str,
        local_id: &str,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            collection: paths::signals(session_id),
            local_id: local_id.to_string(),
            clock,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Open a pairwise view towards `remote_id`
    pub fn link(&self, remote_id: &str) -> Result<SignalLink, StoreError> {
        let subscription = self.store.subscribe(&self.collection)?;
        Ok(SignalLink {
            channel: self.clone(),
            remote_id: remote_id.to_string(),
            subscription,
            seen: HashSet::new(),
        })
    }

    async fn send(&self, to: &str, payload: &str) -> Result<(), StoreError> {
        let envelope = SignalEnvelope {
            from: self.local_id.clone(),
            to: to.to_string(),
            payload: payload.to_string(),
            sent_at: self.clock.now_ms(),
        };
        self.store.add(&self.collection, envelope.to_document()?).await?;
        Ok(())
    }

    /// Delete every envelope sent by or addressed to us
    ///
    /// Run before joining so a rejoin never replays an old negotiation.
    pub async fn clear_own(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (path, doc) in self.store.list(&self.collection).await? {
            let ours = SignalEnvelope::from_document(doc)
                .map(|e| e.from == self.local_id || e.to == self.local_id)
                .unwrap_or(false);
            if ours {
                self.store.delete(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Signaling: cleared {} stale envelopes for {}", removed, self.local_id);
        }
        Ok(removed)
    }
}

/// Ordered signaling messages between us and one remote
pub struct SignalLink {
    channel: SignalingChannel,
    remote_id: String,
    subscription: Subscription,
    seen: HashSet<String>,
}

impl SignalLink {
    pub fn local_id(&self) -> &str {
        &self.channel.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Send a payload to the remote
    pub async fn send(&self, payload: &str) -> Result<(), StoreError> {
        debug!("Signaling: {} -> {} ({} bytes)", self.channel.local_id, self.remote_id, payload.len());
        self.channel.send(&self.remote_id, payload).await
    }

    /// Next payload the remote sent us, or `None` once the store stops delivering
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            let change = self.subscription.recv().await?;
            let Some(doc) = change.document else {
                continue;
            };
            if !self.seen.insert(change.path) {
                continue;
            }
            let Some(envelope) = SignalEnvelope::from_document(doc) else {
                continue;
            };
            if envelope.from == self.remote_id && envelope.to == self.channel.local_id {
                return Some(envelope.payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn channels() -> (Arc<dyn DocumentStore>, SignalingChannel, SignalingChannel, SignalingChannel) {
        let (_clock, shared) = ManualClock::shared(5);
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::with_clock(shared.clone()));
        let host = SignalingChannel::new(store.clone(), "s1", "host", shared.clone());
        let ada = SignalingChannel::new(store.clone(), "s1", "ada", shared.clone());
        let bob = SignalingChannel::new(store.clone(), "s1", "bob", shared);
        (store, host, ada, bob)
    }

    #[tokio::test]
    async fn test_link_only_sees_its_pair_in_order() {
        let (_store, host, ada, bob) = channels();
        let mut ada_from_host = ada.link("host").unwrap();

        let host_to_ada = host.link("ada").unwrap();
        let host_to_bob = host.link("bob").unwrap();
        host_to_bob.send("for bob").await.unwrap();
        host_to_ada.send("first").await.unwrap();
        bob.link("ada").unwrap().send("bob to ada").await.unwrap();
        host_to_ada.send("second").await.unwrap();

        assert_eq!(ada_from_host.recv().await.as_deref(), Some("first"));
        assert_eq!(ada_from_host.recv().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_link_opened_late_sees_earlier_messages() {
        let (_store, host, ada, _bob) = channels();
        host.link("ada").unwrap().send("offer").await.unwrap();

        let mut link = ada.link("host").unwrap();
        assert_eq!(link.recv().await.as_deref(), Some("offer"));
    }

    #[tokio::test]
    async fn test_clear_own_keeps_other_pairs() {
        let (store, host, ada, bob) = channels();
        host.link("ada").unwrap().send("a").await.unwrap();
        ada.link("host").unwrap().send("b").await.unwrap();
        host.link("bob").unwrap().send("c").await.unwrap();

        assert_eq!(ada.clear_own().await.unwrap(), 2);
        let left = store.list(&paths::signals("s1")).await.unwrap();
        assert_eq!(left.len(), 1);

        let mut bob_link = bob.link("host").unwrap();
        assert_eq!(bob_link.recv().await.as_deref(), Some("c"));
    }
}
