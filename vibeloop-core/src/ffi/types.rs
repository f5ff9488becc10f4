//! FFI types exposed via uniffi

use crate::identity::Identity;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::sync::{ChatEvent, EndReason, Participant as InternalParticipant, SessionRecord, TrackRef};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("You need to be signed in to do that")]
    NotAuthenticated,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session is full: {0}")]
    SessionFull(String),

    #[error("Only the host can do that")]
    NotHost,

    #[error("Not in a session")]
    NotInSession,

    #[error("Already in a session")]
    AlreadyInSession,

    #[error("Not a valid session id or link: {0}")]
    InvalidSessionId(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),
}

impl From<SessionError> for CoreError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotAuthenticated => CoreError::NotAuthenticated,
            SessionError::SessionNotFound(id) => CoreError::SessionNotFound(id),
            full @ SessionError::SessionFull { .. } => CoreError::SessionFull(full.to_string()),
            SessionError::NotHost => CoreError::NotHost,
            SessionError::NotInSession => CoreError::NotInSession,
            SessionError::AlreadyInSession => CoreError::AlreadyInSession,
            SessionError::InvalidSessionId(input) => CoreError::InvalidSessionId(input),
            SessionError::Store(e) => CoreError::StoreError(e.to_string()),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::StoreError(e.to_string())
    }
}

/// Track reference exposed via FFI
#[derive(Debug, Clone, PartialEq, uniffi::Record)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    /// URL the audio element loads
    pub locator: String,
    pub duration_secs: f64,
}

impl From<TrackRef> for Track {
    fn from(t: TrackRef) -> Self {
        Self {
            id: t.id,
            title: t.title,
            artist: t.artist,
            locator: t.locator,
            duration_secs: t.duration_secs,
        }
    }
}

impl From<Track> for TrackRef {
    fn from(t: Track) -> Self {
        Self {
            id: t.id,
            title: t.title,
            artist: t.artist,
            locator: t.locator,
            duration_secs: t.duration_secs,
        }
    }
}

/// Participant exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_host: bool,
}

impl Participant {
    fn from_roster(p: InternalParticipant, host_id: &str) -> Self {
        Self {
            is_host: p.id == host_id,
            id: p.id,
            display_name: p.display_name,
        }
    }
}

/// The signed-in user, as provided by the app's auth layer
#[derive(Debug, Clone, uniffi::Record)]
pub struct UserIdentity {
    pub id: String,
    pub display_name: String,
    pub photo_url: Option<String>,
}

impl From<UserIdentity> for Identity {
    fn from(u: UserIdentity) -> Self {
        Self {
            id: u.id,
            display_name: u.display_name,
            photo_url: u.photo_url,
        }
    }
}

/// Session state exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionState {
    pub session_id: String,
    pub host_id: String,
    pub host_name: String,
    pub is_host: bool,
    pub is_playing: bool,
    pub seek_position: f64,
    pub updated_at_ms: u64,
    pub current_track: Option<Track>,
    pub queue: Vec<Track>,
    pub participants: Vec<Participant>,
    pub max_participants: u32,
}

impl SessionState {
    pub(crate) fn from_record(record: SessionRecord, is_host: bool) -> Self {
        let participants = record
            .roster()
            .into_iter()
            .map(|p| Participant::from_roster(p, &record.host_id))
            .collect();
        Self {
            session_id: record.id,
            host_id: record.host_id,
            host_name: record.host_name,
            is_host,
            is_playing: record.is_playing,
            seek_position: record.seek_position,
            updated_at_ms: record.updated_at,
            current_track: record.current_track.map(Track::from),
            queue: record.queue.into_iter().map(Track::from).collect(),
            participants,
            max_participants: record.max_participants as u32,
        }
    }
}

/// Chat line or reaction exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: Option<String>,
    pub emoji: Option<String>,
    pub sent_at_ms: u64,
}

impl From<ChatEvent> for ChatMessage {
    fn from(e: ChatEvent) -> Self {
        Self {
            id: e.id,
            sender_id: e.sender_id,
            sender_name: e.sender_name,
            text: e.text,
            emoji: e.emoji,
            sent_at_ms: e.sent_at,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum SessionEndReason {
    HostEnded,
    SessionRemoved,
}

impl From<EndReason> for SessionEndReason {
    fn from(r: EndReason) -> Self {
        match r {
            EndReason::HostEnded => SessionEndReason::HostEnded,
            EndReason::SessionRemoved => SessionEndReason::SessionRemoved,
        }
    }
}

/// A document as seen by the foreign store
#[derive(Debug, Clone, uniffi::Record)]
pub struct StoredDocument {
    pub path: String,
    /// JSON object
    pub json: String,
}

/// Errors a foreign store reports back
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum StoreBridgeError {
    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<uniffi::UnexpectedUniFFICallbackError> for StoreBridgeError {
    fn from(e: uniffi::UnexpectedUniFFICallbackError) -> Self {
        StoreBridgeError::Unavailable { reason: e.reason }
    }
}

impl From<StoreBridgeError> for StoreError {
    fn from(e: StoreBridgeError) -> Self {
        match e {
            StoreBridgeError::NotFound { path } => StoreError::NotFound(path),
            StoreBridgeError::PermissionDenied { path } => StoreError::PermissionDenied(path),
            StoreBridgeError::Unavailable { reason } => StoreError::Unavailable(reason),
        }
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    /// Called whenever the session view changes; `None` when not in a session
    fn on_session_state_changed(&self, state: Option<SessionState>);
    fn on_chat_changed(&self, messages: Vec<ChatMessage>);
    fn on_session_ended(&self, reason: SessionEndReason);
}

/// The platform audio element
#[uniffi::export(callback_interface)]
pub trait AudioBridge: Send + Sync {
    /// Current playback position in seconds
    fn current_time(&self) -> f64;
    fn is_playing(&self) -> bool;
    fn play(&self);
    fn pause(&self);
    fn seek_to(&self, seconds: f64);
    /// Replace the loaded track; call `notify_audio_ready` once it can seek
    fn load(&self, track: Track);
}

/// A foreign document store (e.g. a hosted document database SDK)
///
/// Documents travel as JSON objects. `update` receives field operations as
/// JSON: `{"field": {"op": "set", "value": ...}, "a.b": {"op": "delete"}}`.
/// After `watch(path)` the store must push the current state and every
/// later change through `Session::notify_document_changed`.
#[uniffi::export(callback_interface)]
pub trait StoreBridge: Send + Sync {
    fn get(&self, path: String) -> Result<Option<String>, StoreBridgeError>;
    fn set(&self, path: String, json: String) -> Result<(), StoreBridgeError>;
    fn update(&self, path: String, updates_json: String) -> Result<(), StoreBridgeError>;
    fn delete(&self, path: String) -> Result<(), StoreBridgeError>;
    /// Returns the generated document id
    fn add(&self, collection: String, json: String) -> Result<String, StoreBridgeError>;
    fn list(&self, collection: String) -> Result<Vec<StoredDocument>, StoreBridgeError>;
    fn watch(&self, path: String) -> Result<(), StoreBridgeError>;
}
