//! Session upkeep
//!
//! A host that crashes never deletes its session. Hosts therefore touch
//! `heartbeatAt` while they are alive, and a periodic sweep removes
//! sessions nobody has touched for a long time. The sweep also keeps chat
//! history bounded.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::chat::parse_event;
use crate::config::SessionConfig;
use crate::store::{paths, DocumentStore, FieldUpdates, StoreError};
use crate::sync::SessionRecord;

/// Touch `heartbeatAt` every `interval` until cancelled or the session is gone
pub async fn run_heartbeat(
    store: Arc<dyn DocumentStore>,
    session_id: String,
    interval: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let path = paths::session(&session_id);
    debug!("Heartbeat loop started for {}", session_id);

    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Heartbeat loop cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let updates = FieldUpdates::new().server_timestamp("heartbeatAt");
        match store.update(&path, updates).await {
            Ok(()) => debug!("Heartbeat: touched {}", session_id),
            Err(StoreError::NotFound(_)) => {
                debug!("Heartbeat: session {} is gone, stopping", session_id);
                break;
            }
            Err(e) => warn!("Heartbeat: failed to touch {}: {}", session_id, e),
        }
    }
}

/// Delete every document in a session's `chat` and `signals` collections
pub async fn discard_subcollections(
    store: &dyn DocumentStore,
    session_id: &str,
) -> Result<usize, StoreError> {
    let mut removed = 0;
    for collection in [paths::chat(session_id), paths::signals(session_id)] {
        for (path, _) in store.list(&collection).await? {
            store.delete(&path).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids of the sessions that were removed
    pub sessions_removed: Vec<String>,
    /// Chat events deleted to honour the retention limit
    pub chat_events_trimmed: usize,
}

/// Sweeps inactive sessions and trims chat history
pub struct SessionJanitor {
    store: Arc<dyn DocumentStore>,
    inactive_ttl: Duration,
    chat_retention: usize,
}

impl SessionJanitor {
    pub fn new(store: Arc<dyn DocumentStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            inactive_ttl: config.inactive_session_ttl(),
            chat_retention: config.chat_retention,
        }
    }

    /// Run one sweep as of `now_ms`
    pub async fn sweep(&self, now_ms: u64) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        let ttl_ms = self.inactive_ttl.as_millis() as u64;

        for (path, doc) in self.store.list(paths::SESSIONS).await? {
            let record = match SessionRecord::from_document(&path, doc) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Janitor: skipping {}: {}", path, e);
                    continue;
                }
            };

            let idle_ms = now_ms.saturating_sub(record.last_activity_ms());
            if idle_ms > ttl_ms {
                info!(
                    "Janitor: removing session {} (idle for {}s)",
                    record.id,
                    idle_ms / 1000
                );
                self.store.delete(&path).await?;
                discard_subcollections(self.store.as_ref(), paths::leaf(&path)).await?;
                report.sessions_removed.push(paths::leaf(&path).to_string());
                continue;
            }

            report.chat_events_trimmed += self.trim_chat(paths::leaf(&path)).await?;
        }

        if !report.sessions_removed.is_empty() || report.chat_events_trimmed > 0 {
            info!(
                "Janitor: removed {} sessions, trimmed {} chat events",
                report.sessions_removed.len(),
                report.chat_events_trimmed
            );
        }
        Ok(report)
    }

    /// Keep only the newest `chat_retention` events
    async fn trim_chat(&self, session_id: &str) -> Result<usize, StoreError> {
        let mut events: Vec<(u64, String)> = self
            .store
            .list(&paths::chat(session_id))
            .await?
            .into_iter()
            .map(|(path, doc)| {
                let sent_at = parse_event(&path, doc).map(|e| e.sent_at).unwrap_or(0);
                (sent_at, path)
            })
            .collect();

        if events.len() <= self.chat_retention {
            return Ok(0);
        }

        events.sort();
        let excess = events.len() - self.chat_retention;
        for (_, path) in events.iter().take(excess) {
            self.store.delete(path).await?;
        }
        debug!("Janitor: trimmed {} chat events from {}", excess, session_id);
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatRelay;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::sync::Participant;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    fn host() -> Participant {
        Participant {
            id: "host".to_string(),
            display_name: "Hana".to_string(),
        }
    }

    async fn seed(store: &MemoryStore, id: &str, created_at: u64) {
        let record = SessionRecord::new(id.to_string(), &host(), None, 20, created_at);
        store
            .set(&paths::session(id), record.to_document().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_sessions() {
        let (_clock, shared) = ManualClock::shared(0);
        let store = Arc::new(MemoryStore::with_clock(shared.clone()));
        seed(&store, "old", 0).await;
        seed(&store, "fresh", 20 * HOUR_MS).await;
        ChatRelay::new(store.clone(), shared, "old")
            .post_welcome("Hana")
            .await
            .unwrap();

        let janitor = SessionJanitor::new(store.clone(), &SessionConfig::default());
        let report = janitor.sweep(25 * HOUR_MS).await.unwrap();

        assert_eq!(report.sessions_removed, vec!["old".to_string()]);
        assert!(store.get(&paths::session("old")).await.unwrap().is_none());
        assert!(store.list(&paths::chat("old")).await.unwrap().is_empty());
        assert!(store.get(&paths::session("fresh")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_session_alive() {
        let (clock, shared) = ManualClock::shared(0);
        let store = Arc::new(MemoryStore::with_clock(shared));
        seed(&store, "s1", 0).await;

        clock.set(23 * HOUR_MS);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(run_heartbeat(
            store.clone(),
            "s1".to_string(),
            Duration::from_millis(10),
            cancel_rx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = cancel_tx.send(());
        heartbeat.await.unwrap();

        let janitor = SessionJanitor::new(store.clone(), &SessionConfig::default());
        let report = janitor.sweep(25 * HOUR_MS).await.unwrap();
        assert!(report.sessions_removed.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_stops_when_session_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(run_heartbeat(
            store,
            "missing".to_string(),
            Duration::from_millis(5),
            cancel_rx,
        ));
        tokio::time::timeout(Duration::from_secs(1), heartbeat)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_chat_is_trimmed_to_newest_events() {
        let (clock, shared) = ManualClock::shared(HOUR_MS);
        let store = Arc::new(MemoryStore::with_clock(shared.clone()));
        seed(&store, "s1", HOUR_MS).await;

        let relay = ChatRelay::new(store.clone(), shared, "s1");
        for i in 0..5 {
            clock.advance(Duration::from_millis(10));
            relay.send_text(&host(), &format!("message {}", i)).await.unwrap();
        }

        let config = SessionConfig {
            chat_retention: 3,
            ..Default::default()
        };
        let janitor = SessionJanitor::new(store.clone(), &config);
        let report = janitor.sweep(HOUR_MS + 1_000).await.unwrap();
        assert_eq!(report.chat_events_trimmed, 2);

        let left: Vec<String> = store
            .list(&paths::chat("s1"))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|(path, doc)| parse_event(&path, doc))
            .filter_map(|e| e.text)
            .collect();
        assert_eq!(left, vec!["message 2", "message 3", "message 4"]);
    }
}
