//! Session implementation for FFI

use std::sync::{Arc, Once};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::clock::system_clock;
use crate::config::SessionConfig;
use crate::identity::SharedIdentity;
use crate::janitor::SessionJanitor;
use crate::peer::{DisabledTransport, Libp2pConfig, Libp2pTransport, PeerTransport};
use crate::session::CoListenSession;
use crate::sync::{SessionSnapshot, SessionStatus};

use super::store_bridge::{ForeignAudio, ForeignStore};
use super::types::*;

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vibeloop_core=debug,libp2p_gossipsub=info"));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false) // Disable colors for Xcode / logcat
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    core: CoListenSession,
    store: Arc<ForeignStore>,
    identity: Arc<SharedIdentity>,
    config: SessionConfig,
    callback: Arc<RwLock<Option<Arc<dyn SessionCallback>>>>,
    /// Handle for cancelling the callback forwarding loop
    forward_cancel: Mutex<Option<oneshot::Sender<()>>>,
    /// Dropped last so session tasks are stopped before it shuts down
    runtime: Runtime,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    ///
    /// `config_json` overrides [`SessionConfig`] fields; missing fields keep
    /// their defaults.
    #[uniffi::constructor]
    pub fn new(
        store: Box<dyn StoreBridge>,
        audio: Box<dyn AudioBridge>,
        config_json: Option<String>,
    ) -> Result<Self, CoreError> {
        init_tracing();
        info!("Initializing vibeloop-core session");

        let config = match config_json {
            Some(json) => SessionConfig::from_json(&json)
                .map_err(|e| CoreError::RuntimeError(format!("invalid config: {}", e)))?,
            None => SessionConfig::default(),
        };

        let runtime = Runtime::new().map_err(|e| CoreError::RuntimeError(e.to_string()))?;

        // The swarm spawns onto the current runtime
        let transport: Arc<dyn PeerTransport> = {
            let _guard = runtime.enter();
            match Libp2pTransport::start(Libp2pConfig::default()) {
                Ok(transport) => {
                    info!("Direct peer channel ready ({})", transport.local_peer_id());
                    Arc::new(transport)
                }
                Err(e) => {
                    warn!("Direct peer channel unavailable, using store only: {}", e);
                    Arc::new(DisabledTransport)
                }
            }
        };

        let store = Arc::new(ForeignStore::new(Arc::from(store)));
        let identity = Arc::new(SharedIdentity::anonymous());
        let core = CoListenSession::new(
            store.clone(),
            identity.clone(),
            Arc::new(ForeignAudio::new(Arc::from(audio))),
            transport,
            system_clock(),
            config.clone(),
        );

        Ok(Self {
            core,
            store,
            identity,
            config,
            callback: Arc::new(RwLock::new(None)),
            forward_cancel: Mutex::new(None),
            runtime,
        })
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.callback.write() = Some(Arc::from(callback));
        self.start_forwarding();
    }

    /// Set (or clear) the signed-in user
    pub fn set_user(&self, user: Option<UserIdentity>) {
        match &user {
            Some(u) => info!("Signed in as {}", u.display_name),
            None => info!("Signed out"),
        }
        self.identity.set(user.map(Into::into));
    }

    /// Create a new session (become host); returns the session id
    pub fn create_session(&self, initial_track: Option<Track>) -> Result<String, CoreError> {
        let id = self
            .runtime
            .block_on(self.core.create_session(initial_track.map(Into::into)))?;
        Ok(id.to_string())
    }

    /// Join a session by id or share link
    pub fn join_session(&self, session: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.join_session(&session))?;
        Ok(())
    }

    /// Leave the current session (ends it for everyone if we are the host)
    pub fn leave_session(&self) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.leave_session())?;
        Ok(())
    }

    /// Publish the host's playback state (host only)
    pub fn update_playback(
        &self,
        is_playing: bool,
        seek_position: f64,
        track: Option<Track>,
    ) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.update_playback(
            is_playing,
            seek_position,
            track.map(Into::into),
        ))?;
        Ok(())
    }

    pub fn add_to_queue(&self, track: Track) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.add_to_queue(track.into()))?;
        Ok(())
    }

    pub fn remove_from_queue(&self, track_id: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.remove_from_queue(&track_id))?;
        Ok(())
    }

    pub fn send_chat_message(&self, text: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.send_chat_message(&text))?;
        Ok(())
    }

    pub fn send_emoji(&self, emoji: String) -> Result<(), CoreError> {
        self.runtime.block_on(self.core.send_emoji(&emoji))?;
        Ok(())
    }

    /// The audio element finished loading a track and can seek
    pub fn notify_audio_ready(&self) {
        self.core.notify_audio_ready();
    }

    /// Push a change observed by the foreign store (`json = None` for deletes)
    pub fn notify_document_changed(&self, path: String, json: Option<String>) -> Result<(), CoreError> {
        self.store.notify_document_changed(&path, json.as_deref())?;
        Ok(())
    }

    /// Remove inactive sessions and trim chat history; returns sessions removed
    pub fn sweep_inactive_sessions(&self) -> Result<u32, CoreError> {
        let janitor = SessionJanitor::new(self.store.clone(), &self.config);
        let now = crate::clock::current_time_ms();
        let report = self.runtime.block_on(janitor.sweep(now))?;
        Ok(report.sessions_removed.len() as u32)
    }

    /// Get current session state
    pub fn get_session_state(&self) -> Option<SessionState> {
        state_of(self.core.snapshot())
    }

    pub fn get_chat_messages(&self) -> Vec<ChatMessage> {
        self.core
            .chat_messages()
            .into_iter()
            .map(ChatMessage::from)
            .collect()
    }

    /// Check if we are the host
    pub fn is_host(&self) -> bool {
        self.core.snapshot().is_host
    }

    /// Number of open direct peer links
    pub fn peer_link_count(&self) -> u32 {
        self.core.peer_link_count() as u32
    }
}

impl Session {
    /// Forward state and chat changes to the callback until replaced
    fn start_forwarding(&self) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        if let Some(previous) = self.forward_cancel.lock().replace(cancel_tx) {
            let _ = previous.send(());
        }

        let mut snapshots = self.core.watch();
        let mut chat = self.core.watch_chat();
        let callback = Arc::clone(&self.callback);

        self.runtime.spawn(async move {
            // Current state first
            let snapshot = snapshots.borrow_and_update().clone();
            emit_snapshot(&callback, &snapshot);
            let messages = chat.borrow_and_update().clone();
            emit_chat(&callback, messages);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        debug!("Callback forwarding cancelled");
                        break;
                    }
                    changed = snapshots.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = snapshots.borrow_and_update().clone();
                        emit_snapshot(&callback, &snapshot);
                    }
                    changed = chat.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let messages = chat.borrow_and_update().clone();
                        emit_chat(&callback, messages);
                    }
                }
            }
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(cancel) = self.forward_cancel.lock().take() {
            let _ = cancel.send(());
        }
    }
}

fn state_of(snapshot: SessionSnapshot) -> Option<SessionState> {
    let is_host = snapshot.is_host;
    snapshot
        .session
        .map(|record| SessionState::from_record(record, is_host))
}

fn emit_snapshot(callback: &RwLock<Option<Arc<dyn SessionCallback>>>, snapshot: &SessionSnapshot) {
    let Some(cb) = callback.read().clone() else {
        return;
    };
    if let SessionStatus::Ended(reason) = snapshot.status {
        cb.on_session_ended(reason.into());
    }
    cb.on_session_state_changed(state_of(snapshot.clone()));
}

fn emit_chat(callback: &RwLock<Option<Arc<dyn SessionCallback>>>, messages: Vec<crate::sync::ChatEvent>) {
    if let Some(cb) = callback.read().clone() {
        cb.on_chat_changed(messages.into_iter().map(ChatMessage::from).collect());
    }
}
