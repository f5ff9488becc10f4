//! Session State Management

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::protocol::{PlaybackUpdate, TrackRef};
use crate::config::DEFAULT_MAX_PARTICIPANTS;
use crate::store::{Document, StoreError};

fn default_max_participants() -> usize {
    DEFAULT_MAX_PARTICIPANTS
}

/// The session document stored at `sessions/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub host_id: String,
    pub host_name: String,
    pub is_playing: bool,
    #[serde(default)]
    pub current_track: Option<TrackRef>,
    #[serde(default)]
    pub queue: Vec<TrackRef>,
    /// Seconds into `current_track` at `updated_at`
    pub seek_position: f64,
    /// Time of the last host playback mutation (ms since epoch)
    pub updated_at: u64,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub participant_names: BTreeMap<String, String>,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<u64>,
}

impl SessionRecord {
    /// A fresh record for a session the host just created
    pub fn new(
        id: String,
        host: &Participant,
        initial_track: Option<TrackRef>,
        max_participants: usize,
        now_ms: u64,
    ) -> Self {
        let mut participant_names = BTreeMap::new();
        participant_names.insert(host.id.clone(), host.display_name.clone());

        Self {
            id,
            host_id: host.id.clone(),
            host_name: host.display_name.clone(),
            is_playing: false,
            queue: initial_track.iter().cloned().collect(),
            current_track: initial_track,
            seek_position: 0.0,
            updated_at: now_ms,
            participants: vec![host.id.clone()],
            participant_names,
            max_participants,
            created_at: now_ms,
            heartbeat_at: None,
        }
    }

    pub fn to_document(&self) -> Result<Document, StoreError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(doc)) => Ok(doc),
            Ok(_) => Err(self.malformed("record did not serialize to an object")),
            Err(e) => Err(self.malformed(&e.to_string())),
        }
    }

    pub fn from_document(path: &str, doc: Document) -> Result<Self, StoreError> {
        serde_json::from_value(serde_json::Value::Object(doc)).map_err(|e| StoreError::Malformed {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    fn malformed(&self, reason: &str) -> StoreError {
        StoreError::Malformed {
            path: crate::store::paths::session(&self.id),
            reason: reason.to_string(),
        }
    }

    pub fn is_member(&self, participant_id: &str) -> bool {
        self.participants.iter().any(|p| p == participant_id)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.max_participants
    }

    /// The playback tuple this record carries
    pub fn playback(&self) -> PlaybackUpdate {
        PlaybackUpdate {
            is_playing: self.is_playing,
            seek_position: self.seek_position,
            track: self.current_track.clone(),
            timestamp_ms: self.updated_at,
        }
    }

    /// Latest activity seen on the session, for inactivity sweeps
    pub fn last_activity_ms(&self) -> u64 {
        self.updated_at
            .max(self.created_at)
            .max(self.heartbeat_at.unwrap_or_default())
    }

    /// Participants with display names (host first, then sorted by name)
    pub fn roster(&self) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .participants
            .iter()
            .map(|id| Participant {
                id: id.clone(),
                display_name: self
                    .participant_names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| "?".to_string()),
            })
            .collect();
        list.sort_by(|a, b| {
            let a_host = a.id == self.host_id;
            let b_host = b.id == self.host_id;
            match (a_host, b_host) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a
                    .display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase()),
            }
        });
        list
    }
}

/// Someone in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
}

/// A chat line or emoji reaction, stored at `sessions/{id}/chat/{eventId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default)]
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    /// ms since epoch
    pub sent_at: u64,
}

/// Why a session ended for us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The host left, which deletes the session
    HostEnded,
    /// The session record disappeared while we were hosting
    SessionRemoved,
}

/// An active session as one client sees it
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Local mirror of the session record
    pub record: SessionRecord,
    /// Ourselves
    pub local: Participant,
}

impl ActiveSession {
    pub fn session_id(&self) -> &str {
        &self.record.id
    }
}

/// Lifecycle of a client with respect to co-listening
#[derive(Debug, Clone, Default)]
pub enum SessionPhase {
    /// Not in any session
    #[default]
    Idle,
    /// We created the session and own its playback
    Hosting(ActiveSession),
    /// We mirror someone else's playback
    Listening(ActiveSession),
    /// The session ended underneath us
    Ended { session_id: String, reason: EndReason },
}

impl SessionPhase {
    /// Check if we're hosting or listening
    pub fn is_active(&self) -> bool {
        matches!(self, SessionPhase::Hosting(_) | SessionPhase::Listening(_))
    }

    pub fn is_host(&self) -> bool {
        matches!(self, SessionPhase::Hosting(_))
    }

    /// Get the active session if we're in one
    pub fn active(&self) -> Option<&ActiveSession> {
        match self {
            SessionPhase::Hosting(s) | SessionPhase::Listening(s) => Some(s),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveSession> {
        match self {
            SessionPhase::Hosting(s) | SessionPhase::Listening(s) => Some(s),
            _ => None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            SessionPhase::Idle => SessionStatus::Idle,
            SessionPhase::Hosting(_) => SessionStatus::Hosting,
            SessionPhase::Listening(_) => SessionStatus::Listening,
            SessionPhase::Ended { reason, .. } => SessionStatus::Ended(*reason),
        }
    }

    /// Build the observable view of this phase
    pub fn snapshot(&self) -> SessionSnapshot {
        let active = self.active();
        SessionSnapshot {
            status: self.status(),
            session: active.map(|s| s.record.clone()),
            is_host: self.is_host(),
            is_connected: self.is_active(),
            participants: active.map(|s| s.record.roster()).unwrap_or_default(),
        }
    }
}

/// Coarse lifecycle state for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Hosting,
    Listening,
    Ended(EndReason),
}

/// What the UI observes about the current session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub session: Option<SessionRecord>,
    pub is_host: bool,
    pub is_connected: bool,
    pub participants: Vec<Participant>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        SessionPhase::Idle.snapshot()
    }
}
