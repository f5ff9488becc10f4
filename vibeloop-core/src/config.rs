//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on participants per session (host included)
pub const DEFAULT_MAX_PARTICIPANTS: usize = 20;

/// Default drift a listener tolerates before hard-seeking (ms)
pub const DEFAULT_DRIFT_TOLERANCE_MS: u64 = 300;

/// Default time allowed for a direct peer channel to come up (ms)
const DEFAULT_PEER_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;

/// Default interval between host heartbeats (ms)
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default idle time after which the janitor removes a session (24 hours)
const DEFAULT_INACTIVE_SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Default number of chat events kept per session by the janitor
const DEFAULT_CHAT_RETENTION: usize = 50;

/// Tunables for co-listening sessions
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Maximum participants for sessions we create
    pub max_participants: usize,
    /// Drift tolerance for listeners, in milliseconds
    pub drift_tolerance_ms: u64,
    /// How long peer channel negotiation may take before we give up
    pub peer_negotiation_timeout_ms: u64,
    /// How often a host touches `heartbeatAt`
    pub heartbeat_interval_ms: u64,
    /// Idle time after which a session is swept
    pub inactive_session_ttl_ms: u64,
    /// Chat events kept per session when sweeping
    pub chat_retention: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            drift_tolerance_ms: DEFAULT_DRIFT_TOLERANCE_MS,
            peer_negotiation_timeout_ms: DEFAULT_PEER_NEGOTIATION_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            inactive_session_ttl_ms: DEFAULT_INACTIVE_SESSION_TTL_MS,
            chat_retention: DEFAULT_CHAT_RETENTION,
        }
    }
}

impl SessionConfig {
    /// Parse a config from JSON, filling in defaults for missing fields
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn drift_tolerance(&self) -> Duration {
        Duration::from_millis(self.drift_tolerance_ms)
    }

    pub fn peer_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_negotiation_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn inactive_session_ttl(&self) -> Duration {
        Duration::from_millis(self.inactive_session_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_participants, 20);
        assert_eq!(config.drift_tolerance(), Duration::from_millis(300));
        assert_eq!(config.chat_retention, 50);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"maxParticipants": 4, "driftToleranceMs": 150}"#)
            .unwrap();
        assert_eq!(config.max_participants, 4);
        assert_eq!(config.drift_tolerance_ms, 150);
        assert_eq!(config.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(SessionConfig::from_json(r#"{"maxParticipants": "lots"}"#).is_err());
    }
}
