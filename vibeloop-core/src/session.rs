//! Co-listening Session
//!
//! [`CoListenSession`] owns one client's side of a session: the lifecycle
//! state machine, the event loop that consumes store subscriptions and peer
//! messages, and the drift corrector that keeps a listener's audio in step
//! with the host.
//!
//! Host writes are never optimistic. Local state only changes after the
//! store confirmed the write, and only then is the update pushed over the
//! peer links.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::{ChatLog, ChatRelay};
use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::drift::{AudioOutput, DriftCorrector, Offer, UpdateSource};
use crate::identity::IdentityProvider;
use crate::janitor;
use crate::peer::{PeerChannelManager, PeerTransport, SignalingChannel};
use crate::store::{paths, DocumentChange, DocumentStore, FieldUpdates, StoreError, Subscription};
use crate::sync::{
    ActiveSession, ChatEvent, EndReason, Participant, PeerMessage, PlaybackUpdate, SessionId,
    SessionPhase, SessionRecord, SessionSnapshot, TrackRef,
};

/// Session-level errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("You need to be signed in to do that")]
    NotAuthenticated,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is full ({max} participants)")]
    SessionFull { id: String, max: usize },

    #[error("Only the host can do that")]
    NotHost,

    #[error("Not in a session")]
    NotInSession,

    #[error("Already in a session")]
    AlreadyInSession,

    #[error("Not a valid session id or link: {0}")]
    InvalidSessionId(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// State guarded by one lock; drift evaluation runs under it too
struct Inner {
    phase: SessionPhase,
    /// Bumped on every lifecycle transition so stale handlers can tell
    epoch: u64,
    /// A host leave is deleting the record
    leaving: bool,
    drift: DriftCorrector,
    chat: ChatLog,
}

/// Tasks and links of the active session
struct ActiveRuntime {
    epoch: u64,
    peers: Arc<PeerChannelManager>,
    loop_cancel: Option<oneshot::Sender<()>>,
    heartbeat_cancel: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveRuntime {
    fn stop(mut self) {
        if let Some(cancel) = self.loop_cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(cancel) = self.heartbeat_cancel.take() {
            let _ = cancel.send(());
        }
        self.peers.close_all();
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    audio: Arc<dyn AudioOutput>,
    transport: Arc<dyn PeerTransport>,
    clock: SharedClock,
    config: SessionConfig,
    inner: Mutex<Inner>,
    runtime: Mutex<Option<ActiveRuntime>>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    chat_tx: watch::Sender<Vec<ChatEvent>>,
    /// Serializes create/join/leave
    lifecycle: tokio::sync::Mutex<()>,
    /// Serializes host writes so timestamps stay monotonic
    host_writes: tokio::sync::Mutex<()>,
}

/// Whether the event loop keeps running
enum Flow {
    Continue,
    Stop,
}

/// One client's co-listening session
pub struct CoListenSession {
    shared: Arc<Shared>,
}

impl CoListenSession {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        audio: Arc<dyn AudioOutput>,
        transport: Arc<dyn PeerTransport>,
        clock: SharedClock,
        config: SessionConfig,
    ) -> Self {
        let drift = DriftCorrector::new(config.drift_tolerance(), clock.clone());
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());
        let (chat_tx, _) = watch::channel(Vec::new());

        Self {
            shared: Arc::new(Shared {
                store,
                identity,
                audio,
                transport,
                clock,
                config,
                inner: Mutex::new(Inner {
                    phase: SessionPhase::Idle,
                    epoch: 0,
                    leaving: false,
                    drift,
                    chat: ChatLog::new(),
                }),
                runtime: Mutex::new(None),
                snapshot_tx,
                chat_tx,
                lifecycle: tokio::sync::Mutex::new(()),
                host_writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a session and become its host
    pub async fn create_session(
        &self,
        initial_track: Option<TrackRef>,
    ) -> Result<SessionId, SessionError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let host = shared.participant()?;
        if shared.inner.lock().phase.is_active() {
            return Err(SessionError::AlreadyInSession);
        }

        let now = shared.clock.now_ms();
        let id = SessionId::generate(now);
        let path = paths::session(id.as_str());
        let record = SessionRecord::new(
            id.to_string(),
            &host,
            initial_track,
            shared.config.max_participants,
            now,
        );

        shared.store.set(&path, record.to_document()?).await?;

        let subscriptions = shared.subscribe(id.as_str());
        let (session_sub, chat_sub) = match subscriptions {
            Ok(subs) => subs,
            Err(e) => {
                if let Err(cleanup) = shared.store.delete(&path).await {
                    warn!("Failed to remove half-created session {}: {}", id, cleanup);
                }
                return Err(e.into());
            }
        };

        let epoch = shared.adopt(SessionPhase::Hosting(ActiveSession {
            record,
            local: host.clone(),
        }));
        Shared::start_runtime(shared, epoch, id.as_str(), &host.id, session_sub, chat_sub, None);
        info!("Created session {} as {}", id, host.display_name);

        let relay = ChatRelay::new(shared.store.clone(), shared.clock.clone(), id.as_str());
        if let Err(e) = relay.post_welcome(&host.display_name).await {
            warn!("Failed to post welcome message: {}", e);
        }

        Ok(id)
    }

    /// Join an existing session as a listener
    ///
    /// Accepts a bare session id or a share link.
    pub async fn join_session(&self, session: &str) -> Result<(), SessionError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let me = shared.participant()?;
        let id = SessionId::parse(session)
            .ok_or_else(|| SessionError::InvalidSessionId(session.to_string()))?;
        if shared.inner.lock().phase.is_active() {
            return Err(SessionError::AlreadyInSession);
        }

        let path = paths::session(id.as_str());
        let doc = shared
            .store
            .get(&path)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
        let mut record = SessionRecord::from_document(&path, doc)?;

        let rejoining = record.is_member(&me.id);
        if !rejoining && record.is_full() {
            return Err(SessionError::SessionFull {
                id: id.to_string(),
                max: record.max_participants,
            });
        }

        let signaling = shared.signaling(id.as_str(), &me.id);
        if let Err(e) = signaling.clear_own().await {
            debug!("Could not clear old signaling for {}: {}", me.id, e);
        }

        let updates = FieldUpdates::new()
            .array_union("participants", vec![json!(me.id)])
            .set(format!("participantNames.{}", me.id), me.display_name.clone());
        shared.store.update(&path, updates).await.map_err(|e| match e {
            StoreError::NotFound(_) => SessionError::SessionNotFound(id.to_string()),
            other => other.into(),
        })?;

        let (session_sub, chat_sub) = match shared.subscribe(id.as_str()) {
            Ok(subs) => subs,
            Err(e) => {
                if let Err(cleanup) = shared.store.update(&path, leave_updates(&me.id)).await {
                    warn!("Failed to undo join of {}: {}", id, cleanup);
                }
                return Err(e.into());
            }
        };

        if !rejoining {
            record.participants.push(me.id.clone());
        }
        record.participant_names.insert(me.id.clone(), me.display_name.clone());
        let host_id = record.host_id.clone();

        let epoch = shared.adopt(SessionPhase::Listening(ActiveSession {
            record,
            local: me.clone(),
        }));
        Shared::start_runtime(
            shared,
            epoch,
            id.as_str(),
            &me.id,
            session_sub,
            chat_sub,
            Some(&host_id),
        );
        info!("Joined session {} as {}", id, me.display_name);
        Ok(())
    }

    /// Leave the current session
    ///
    /// A host ends the session for everyone; a listener only removes itself.
    /// The event loop and peer links are stopped before this returns.
    pub async fn leave_session(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let _lifecycle = shared.lifecycle.lock().await;
        let phase = shared.inner.lock().phase.clone();

        match phase {
            SessionPhase::Idle => Ok(()),
            SessionPhase::Ended { session_id, .. } => {
                debug!("Clearing ended session {}", session_id);
                shared.teardown();
                Ok(())
            }
            SessionPhase::Hosting(active) => {
                let id = active.session_id().to_string();
                shared.inner.lock().leaving = true;
                if let Err(e) = shared.store.delete(&paths::session(&id)).await {
                    warn!("Failed to end session {}: {}", id, e);
                    shared.inner.lock().leaving = false;
                    return Err(e.into());
                }

                shared.teardown();
                info!("Ended session {}", id);

                if let Err(e) = janitor::discard_subcollections(shared.store.as_ref(), &id).await {
                    debug!("Failed to discard data of session {}: {}", id, e);
                }
                Ok(())
            }
            SessionPhase::Listening(active) => {
                let id = active.session_id().to_string();
                let me = active.local.id.clone();
                shared.teardown();
                info!("Left session {}", id);

                if let Err(e) = shared.signaling(&id, &me).clear_own().await {
                    debug!("Could not clear signaling for {}: {}", me, e);
                }
                match shared.store.update(&paths::session(&id), leave_updates(&me)).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                    Err(e) => {
                        warn!("Failed to remove {} from session {}: {}", me, id, e);
                        Err(e.into())
                    }
                }
            }
        }
    }

    // =========================================================================
    // Host controls
    // =========================================================================

    /// Publish a new playback state (host only)
    pub async fn update_playback(
        &self,
        is_playing: bool,
        seek_position: f64,
        track: Option<TrackRef>,
    ) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.participant()?;
        let _writes = shared.host_writes.lock().await;
        let (epoch, session_id, previous) = shared.hosted(|record| record.updated_at)?;

        // Strictly newer than the last write so listeners never see a tie
        let timestamp_ms = shared.clock.now_ms().max(previous + 1);
        let mut updates = FieldUpdates::new()
            .set("isPlaying", is_playing)
            .set("seekPosition", seek_position)
            .set("updatedAt", timestamp_ms);
        if let Some(track) = &track {
            updates = updates.set("currentTrack", to_value(&session_id, track)?);
        }
        shared.store.update(&paths::session(&session_id), updates).await?;

        let update = PlaybackUpdate {
            is_playing,
            seek_position,
            track,
            timestamp_ms,
        };
        let peers = {
            let mut inner = shared.inner.lock();
            if inner.epoch != epoch {
                return Ok(());
            }
            if let SessionPhase::Hosting(active) = &mut inner.phase {
                let record = &mut active.record;
                record.is_playing = update.is_playing;
                record.seek_position = update.seek_position;
                record.updated_at = record.updated_at.max(update.timestamp_ms);
                if let Some(track) = &update.track {
                    record.current_track = Some(track.clone());
                }
            }
            shared.publish(&inner);
            shared.peers(epoch)
        };

        if let Some(peers) = peers {
            let sent = peers.broadcast(&PeerMessage::PlaybackUpdate(update));
            debug!("Playback update sent to {} peers", sent);
        }
        Ok(())
    }

    /// Append a track to the queue (host only)
    pub async fn add_to_queue(&self, track: TrackRef) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.participant()?;
        let _writes = shared.host_writes.lock().await;
        let (epoch, session_id, _) = shared.hosted(|_| ())?;

        let mut queue = shared.read_queue(&session_id).await?;
        info!("Queueing {} - {}", track.artist, track.title);
        queue.push(track);
        shared.write_queue(epoch, &session_id, queue).await
    }

    /// Remove every queue entry with `track_id` (host only)
    pub async fn remove_from_queue(&self, track_id: &str) -> Result<(), SessionError> {
        let shared = &self.shared;
        shared.participant()?;
        let _writes = shared.host_writes.lock().await;
        let (epoch, session_id, _) = shared.hosted(|_| ())?;

        let mut queue = shared.read_queue(&session_id).await?;
        let before = queue.len();
        queue.retain(|t| t.id != track_id);
        if queue.len() == before {
            debug!("Track {} not in queue, nothing to remove", track_id);
            return Ok(());
        }
        shared.write_queue(epoch, &session_id, queue).await
    }

    // =========================================================================
    // Chat
    // =========================================================================

    /// Send a chat message; failures are logged, never returned
    pub async fn send_chat_message(&self, text: &str) -> Result<(), SessionError> {
        let (relay, me) = self.shared.chat_relay()?;
        if let Err(e) = relay.send_text(&me, text).await {
            warn!("Failed to send chat message: {}", e);
        }
        Ok(())
    }

    /// Send an emoji reaction; failures are logged, never returned
    pub async fn send_emoji(&self, emoji: &str) -> Result<(), SessionError> {
        let (relay, me) = self.shared.chat_relay()?;
        if let Err(e) = relay.send_emoji(&me, emoji).await {
            warn!("Failed to send reaction: {}", e);
        }
        Ok(())
    }

    // =========================================================================
    // Audio element events and observation
    // =========================================================================

    /// The audio element can seek in the newly loaded track
    pub fn notify_audio_ready(&self) {
        let shared = &self.shared;
        let mut inner = shared.inner.lock();
        if !matches!(inner.phase, SessionPhase::Listening(_)) {
            return;
        }
        if let Some(evaluation) = inner.drift.on_ready_to_seek(shared.audio.as_ref()) {
            debug!("Track ready, corrected to {:.3}s", evaluation.expected_position);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn chat_messages(&self) -> Vec<ChatEvent> {
        self.shared.chat_tx.borrow().clone()
    }

    pub fn watch_chat(&self) -> watch::Receiver<Vec<ChatEvent>> {
        self.shared.chat_tx.subscribe()
    }

    /// Number of direct peer links currently open
    pub fn peer_link_count(&self) -> usize {
        self.shared
            .runtime
            .lock()
            .as_ref()
            .map(|r| r.peers.ready_count())
            .unwrap_or(0)
    }
}

impl Drop for CoListenSession {
    fn drop(&mut self) {
        if let Some(runtime) = self.shared.runtime.lock().take() {
            runtime.stop();
        }
    }
}

fn leave_updates(participant_id: &str) -> FieldUpdates {
    FieldUpdates::new()
        .array_remove("participants", vec![json!(participant_id)])
        .delete(format!("participantNames.{}", participant_id))
}

fn to_value<T: serde::Serialize>(session_id: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Malformed {
        path: paths::session(session_id),
        reason: e.to_string(),
    })
}

impl Shared {
    fn participant(&self) -> Result<Participant, SessionError> {
        let identity = self
            .identity
            .current()
            .ok_or(SessionError::NotAuthenticated)?;
        Ok(Participant {
            id: identity.id,
            display_name: identity.display_name,
        })
    }

    fn signaling(&self, session_id: &str, local_id: &str) -> SignalingChannel {
        SignalingChannel::new(self.store.clone(), session_id, local_id, self.clock.clone())
    }

    fn subscribe(&self, session_id: &str) -> Result<(Subscription, Subscription), StoreError> {
        let session = self.store.subscribe(&paths::session(session_id))?;
        let chat = self.store.subscribe(&paths::chat(session_id))?;
        Ok((session, chat))
    }

    /// Current epoch, session id, and a value read from the hosted record
    fn hosted<T>(
        &self,
        read: impl FnOnce(&SessionRecord) -> T,
    ) -> Result<(u64, String, T), SessionError> {
        let inner = self.inner.lock();
        match &inner.phase {
            SessionPhase::Hosting(active) => Ok((
                inner.epoch,
                active.session_id().to_string(),
                read(&active.record),
            )),
            SessionPhase::Listening(_) => Err(SessionError::NotHost),
            _ => Err(SessionError::NotInSession),
        }
    }

    fn chat_relay(&self) -> Result<(ChatRelay, Participant), SessionError> {
        self.participant()?;
        let inner = self.inner.lock();
        let active = inner.phase.active().ok_or(SessionError::NotInSession)?;
        let relay = ChatRelay::new(self.store.clone(), self.clock.clone(), active.session_id());
        Ok((relay, active.local.clone()))
    }

    fn peers(&self, epoch: u64) -> Option<Arc<PeerChannelManager>> {
        self.runtime
            .lock()
            .as_ref()
            .filter(|r| r.epoch == epoch)
            .map(|r| r.peers.clone())
    }

    async fn read_queue(&self, session_id: &str) -> Result<Vec<TrackRef>, SessionError> {
        let path = paths::session(session_id);
        let doc = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        Ok(SessionRecord::from_document(&path, doc)?.queue)
    }

    async fn write_queue(
        &self,
        epoch: u64,
        session_id: &str,
        queue: Vec<TrackRef>,
    ) -> Result<(), SessionError> {
        let updates = FieldUpdates::new().set("queue", to_value(session_id, &queue)?);
        self.store.update(&paths::session(session_id), updates).await?;

        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            if let Some(active) = inner.phase.active_mut() {
                active.record.queue = queue;
            }
            self.publish(&inner);
        }
        Ok(())
    }

    /// Enter a new active phase and return its epoch
    fn adopt(&self, phase: SessionPhase) -> u64 {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.leaving = false;
        inner.chat.clear();
        if matches!(phase, SessionPhase::Listening(_)) {
            inner.drift.start();
        } else {
            inner.drift.stop();
        }
        inner.phase = phase;
        self.publish(&inner);
        self.publish_chat(&inner);
        inner.epoch
    }

    /// Stop everything and go back to idle
    fn teardown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.leaving = false;
            inner.drift.stop();
            inner.chat.clear();
            inner.phase = SessionPhase::Idle;
            self.publish(&inner);
            self.publish_chat(&inner);
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.stop();
        }
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.phase.snapshot());
    }

    fn publish_chat(&self, inner: &Inner) {
        self.chat_tx.send_replace(inner.chat.events().to_vec());
    }

    /// Spawn the event loop (and the heartbeat, for hosts)
    fn start_runtime(
        shared: &Arc<Shared>,
        epoch: u64,
        session_id: &str,
        local_id: &str,
        session_sub: Subscription,
        chat_sub: Subscription,
        host_id: Option<&str>,
    ) {
        let (peers, peer_rx) = PeerChannelManager::new(
            shared.transport.clone(),
            shared.signaling(session_id, local_id),
            shared.config.peer_negotiation_timeout(),
        );
        let peers = Arc::new(peers);
        // Listeners connect in the background; the join never waits for it
        if let Some(host_id) = host_id {
            peers.accept_host(host_id);
        }

        let (loop_cancel, loop_cancel_rx) = oneshot::channel();
        let mut tasks = vec![tokio::spawn(run_event_loop(
            shared.clone(),
            epoch,
            peers.clone(),
            session_sub,
            chat_sub,
            peer_rx,
            loop_cancel_rx,
        ))];

        let mut heartbeat_cancel = None;
        if host_id.is_none() {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            tasks.push(tokio::spawn(janitor::run_heartbeat(
                shared.store.clone(),
                session_id.to_string(),
                shared.config.heartbeat_interval(),
                cancel_rx,
            )));
            heartbeat_cancel = Some(cancel_tx);
        }

        let previous = shared.runtime.lock().replace(ActiveRuntime {
            epoch,
            peers,
            loop_cancel: Some(loop_cancel),
            heartbeat_cancel,
            tasks,
        });
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    // =========================================================================
    // Event handlers
    // =========================================================================

    fn on_session_change(&self, epoch: u64, peers: &PeerChannelManager, change: DocumentChange) -> Flow {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Flow::Stop;
        }

        let Some(doc) = change.document else {
            if inner.leaving {
                return Flow::Continue;
            }
            let Some(active) = inner.phase.active() else {
                return Flow::Stop;
            };
            let session_id = active.session_id().to_string();
            let reason = if inner.phase.is_host() {
                EndReason::SessionRemoved
            } else {
                EndReason::HostEnded
            };
            info!("Session {} ended ({:?})", session_id, reason);
            inner.epoch += 1;
            inner.drift.stop();
            inner.phase = SessionPhase::Ended { session_id, reason };
            self.publish(&inner);
            drop(inner);
            self.stop_runtime(epoch);
            return Flow::Stop;
        };

        let incoming = match SessionRecord::from_document(&change.path, doc) {
            Ok(record) => record,
            Err(e) => {
                warn!("Ignoring session update: {}", e);
                return Flow::Continue;
            }
        };

        let Inner { phase, drift, .. } = &mut *inner;
        match phase {
            SessionPhase::Hosting(active) => {
                let before: HashSet<String> = active.record.participants.iter().cloned().collect();
                let after: HashSet<String> = incoming.participants.iter().cloned().collect();
                let local_id = active.local.id.clone();

                let mut record = incoming;
                // Our own confirmed writes may be ahead of this snapshot
                if record.updated_at < active.record.updated_at {
                    record.is_playing = active.record.is_playing;
                    record.seek_position = active.record.seek_position;
                    record.current_track = active.record.current_track.clone();
                    record.updated_at = active.record.updated_at;
                }
                active.record = record;

                for joined in after.difference(&before).filter(|id| **id != local_id) {
                    info!("Listener {} joined", joined);
                    peers.connect_listener(joined);
                }
                for left in before.difference(&after) {
                    info!("Listener {} left", left);
                    peers.disconnect(left);
                }
            }
            SessionPhase::Listening(active) => {
                let playback = incoming.playback();
                active.record = incoming;
                if let Offer::Applied(_) = drift.offer(&playback, UpdateSource::Store, self.audio.as_ref()) {
                    debug!("Applied store update (ts {})", playback.timestamp_ms);
                }
                mirror_latest(active, drift);
            }
            _ => return Flow::Stop,
        }

        self.publish(&inner);
        Flow::Continue
    }

    fn on_chat_change(&self, epoch: u64, change: DocumentChange) -> Flow {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Flow::Stop;
        }
        if inner.chat.apply(change) {
            self.publish_chat(&inner);
        }
        Flow::Continue
    }

    fn on_peer_message(&self, epoch: u64, from: String, message: PeerMessage) -> Flow {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Flow::Stop;
        }

        let Inner { phase, drift, .. } = &mut *inner;
        let SessionPhase::Listening(active) = phase else {
            debug!("Ignoring peer message from {} while not listening", from);
            return Flow::Continue;
        };
        if from != active.record.host_id {
            debug!("Ignoring peer message from non-host {}", from);
            return Flow::Continue;
        }

        match message {
            PeerMessage::PlaybackUpdate(update) => {
                if let Offer::Applied(_) = drift.offer(&update, UpdateSource::Peer, self.audio.as_ref()) {
                    debug!("Applied peer update (ts {})", update.timestamp_ms);
                    mirror_latest(active, drift);
                    self.publish(&inner);
                }
            }
            PeerMessage::Bye => {}
        }
        Flow::Continue
    }

    fn stop_runtime(&self, epoch: u64) {
        let mut runtime = self.runtime.lock();
        if runtime.as_ref().map(|r| r.epoch == epoch).unwrap_or(false) {
            if let Some(runtime) = runtime.take() {
                runtime.stop();
            }
        }
    }
}

/// Reflect the drift loop's authoritative sample in the local mirror
fn mirror_latest(active: &mut ActiveSession, drift: &DriftCorrector) {
    if let Some(latest) = drift.latest() {
        let record = &mut active.record;
        record.is_playing = latest.is_playing;
        record.seek_position = latest.seek_position;
        record.updated_at = latest.timestamp_ms;
        if latest.track.is_some() {
            record.current_track = latest.track.clone();
        }
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    epoch: u64,
    peers: Arc<PeerChannelManager>,
    mut session_sub: Subscription,
    mut chat_sub: Subscription,
    mut peer_rx: mpsc::UnboundedReceiver<(String, PeerMessage)>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    debug!("Session event loop started (epoch {})", epoch);

    loop {
        let flow = tokio::select! {
            _ = &mut cancel_rx => Flow::Stop,
            Some(change) = session_sub.recv() => shared.on_session_change(epoch, &peers, change),
            Some(change) = chat_sub.recv() => shared.on_chat_change(epoch, change),
            Some((from, message)) = peer_rx.recv() => shared.on_peer_message(epoch, from, message),
            else => Flow::Stop,
        };
        if let Flow::Stop = flow {
            break;
        }
    }

    debug!("Session event loop stopped (epoch {})", epoch);
}
