//! Chat and emoji reactions
//!
//! Events are appended to `sessions/{id}/chat` and never edited. Chat is
//! best-effort: nothing here is on the playback path.

use std::sync::Arc;

use tracing::debug;

use crate::clock::SharedClock;
use crate::store::{paths, Document, DocumentChange, DocumentStore, StoreError, Subscription};
use crate::sync::{ChatEvent, Participant};

pub const SYSTEM_SENDER_ID: &str = "system";
pub const SYSTEM_SENDER_NAME: &str = "VibeLoop";
pub const WELCOME_EVENT_ID: &str = "system_welcome";

/// Writes chat events for one session
#[derive(Clone)]
pub struct ChatRelay {
    store: Arc<dyn DocumentStore>,
    clock: SharedClock,
    session_id: String,
}

impl ChatRelay {
    pub fn new(store: Arc<dyn DocumentStore>, clock: SharedClock, session_id: &str) -> Self {
        Self {
            store,
            clock,
            session_id: session_id.to_string(),
        }
    }

    /// Append a text message; blank text is ignored
    pub async fn send_text(
        &self,
        sender: &Participant,
        text: &str,
    ) -> Result<Option<ChatEvent>, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        self.append(sender, Some(text.to_string()), None).await.map(Some)
    }

    /// Append an emoji reaction; blank input is ignored
    pub async fn send_emoji(
        &self,
        sender: &Participant,
        emoji: &str,
    ) -> Result<Option<ChatEvent>, StoreError> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Ok(None);
        }
        self.append(sender, None, Some(emoji.to_string())).await.map(Some)
    }

    async fn append(
        &self,
        sender: &Participant,
        text: Option<String>,
        emoji: Option<String>,
    ) -> Result<ChatEvent, StoreError> {
        let mut event = ChatEvent {
            id: String::new(),
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            text,
            emoji,
            sent_at: self.clock.now_ms(),
        };
        let id = self
            .store
            .add(&paths::chat(&self.session_id), to_document(&self.session_id, &event)?)
            .await?;
        debug!("Chat: {} posted {}", sender.display_name, id);
        event.id = id;
        Ok(event)
    }

    /// Greet everyone in a freshly created session
    pub async fn post_welcome(&self, host_name: &str) -> Result<ChatEvent, StoreError> {
        let event = ChatEvent {
            id: WELCOME_EVENT_ID.to_string(),
            sender_id: SYSTEM_SENDER_ID.to_string(),
            sender_name: SYSTEM_SENDER_NAME.to_string(),
            text: Some(format!(
                "🎉 Welcome to the co-listening session! {} is your host.",
                host_name
            )),
            emoji: None,
            sent_at: self.clock.now_ms(),
        };
        let path = paths::chat_event(&self.session_id, WELCOME_EVENT_ID);
        self.store.set(&path, to_document(&self.session_id, &event)?).await?;
        Ok(event)
    }

    pub fn subscribe(&self) -> Result<Subscription, StoreError> {
        self.store.subscribe(&paths::chat(&self.session_id))
    }
}

fn to_document(session_id: &str, event: &ChatEvent) -> Result<Document, StoreError> {
    match serde_json::to_value(event) {
        Ok(serde_json::Value::Object(doc)) => Ok(doc),
        _ => Err(StoreError::Malformed {
            path: paths::chat(session_id),
            reason: "chat event did not serialize to an object".to_string(),
        }),
    }
}

/// Parse a stored chat event, taking its id from the document path
pub fn parse_event(path: &str, doc: Document) -> Option<ChatEvent> {
    let mut event: ChatEvent = serde_json::from_value(serde_json::Value::Object(doc)).ok()?;
    event.id = paths::leaf(path).to_string();
    // Exactly one of text or emoji
    if event.text.is_some() == event.emoji.is_some() {
        return None;
    }
    Some(event)
}

/// Ordered, de-duplicated view of a session's chat
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    events: Vec<ChatEvent>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one store change in; returns whether the log changed
    pub fn apply(&mut self, change: DocumentChange) -> bool {
        let id = paths::leaf(&change.path).to_string();
        let Some(doc) = change.document else {
            let before = self.events.len();
            self.events.retain(|e| e.id != id);
            return self.events.len() != before;
        };
        let Some(event) = parse_event(&change.path, doc) else {
            debug!("Chat: skipping malformed event {}", change.path);
            return false;
        };

        match self.events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) if *existing == event => return false,
            Some(existing) => *existing = event,
            None => self.events.push(event),
        }
        self.events
            .sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        true
    }

    pub fn events(&self) -> &[ChatEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn ada() -> Participant {
        Participant {
            id: "ada".to_string(),
            display_name: "Ada".to_string(),
        }
    }

    async fn drain(sub: &mut Subscription, log: &mut ChatLog) {
        while let Some(change) = sub.try_recv() {
            log.apply(change);
        }
    }

    #[tokio::test]
    async fn test_events_are_ordered_by_time_then_id() {
        let (clock, shared) = ManualClock::shared(1_000);
        let store = Arc::new(MemoryStore::with_clock(shared.clone()));
        let relay = ChatRelay::new(store, shared, "s1");
        let mut sub = relay.subscribe().unwrap();

        relay.send_text(&ada(), "hello").await.unwrap();
        relay.send_emoji(&ada(), "🔥").await.unwrap();
        clock.advance(Duration::from_millis(5));
        relay.send_text(&ada(), "later").await.unwrap();

        let mut log = ChatLog::new();
        drain(&mut sub, &mut log).await;
        let shown: Vec<String> = log
            .events()
            .iter()
            .map(|e| e.text.clone().or(e.emoji.clone()).unwrap())
            .collect();
        assert_eq!(shown, vec!["hello", "🔥", "later"]);
        assert_eq!(log.events()[0].sender_name, "Ada");
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let (_clock, shared) = ManualClock::shared(0);
        let store = Arc::new(MemoryStore::new());
        let relay = ChatRelay::new(store.clone(), shared, "s1");

        assert!(relay.send_text(&ada(), "   ").await.unwrap().is_none());
        assert!(relay.send_emoji(&ada(), "").await.unwrap().is_none());
        assert!(store.list(&paths::chat("s1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_welcome_event() {
        let (_clock, shared) = ManualClock::shared(0);
        let store = Arc::new(MemoryStore::new());
        let relay = ChatRelay::new(store.clone(), shared, "s1");
        relay.post_welcome("Hana").await.unwrap();

        let doc = store
            .get(&paths::chat_event("s1", WELCOME_EVENT_ID))
            .await
            .unwrap()
            .unwrap();
        let event = parse_event(&paths::chat_event("s1", WELCOME_EVENT_ID), doc).unwrap();
        assert_eq!(event.sender_id, "system");
        assert_eq!(
            event.text.as_deref(),
            Some("🎉 Welcome to the co-listening session! Hana is your host.")
        );
    }

    #[test]
    fn test_duplicates_and_deletes() {
        let event = serde_json::json!({
            "senderId": "ada", "senderName": "Ada", "text": "hi", "sentAt": 5
        });
        let doc = event.as_object().unwrap().clone();
        let change = DocumentChange {
            path: "sessions/s1/chat/e1".to_string(),
            document: Some(doc),
        };

        let mut log = ChatLog::new();
        assert!(log.apply(change.clone()));
        assert!(!log.apply(change));
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].id, "e1");

        assert!(log.apply(DocumentChange {
            path: "sessions/s1/chat/e1".to_string(),
            document: None,
        }));
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_event_with_both_text_and_emoji_is_rejected() {
        let doc = serde_json::json!({
            "senderId": "ada", "senderName": "Ada", "text": "hi", "emoji": "👋", "sentAt": 5
        });
        assert!(parse_event("sessions/s1/chat/e2", doc.as_object().unwrap().clone()).is_none());
    }
}
