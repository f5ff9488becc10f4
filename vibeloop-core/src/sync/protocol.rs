//! Sync Protocol Messages

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A playable track as shared between host and listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRef {
    /// Catalog id of the track
    pub id: String,
    /// Track title
    pub title: String,
    /// Artist name
    pub artist: String,
    /// Where the audio element loads the track from
    pub locator: String,
    /// Duration in seconds
    #[serde(default)]
    pub duration_secs: f64,
}

/// The authoritative playback tuple a host publishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackUpdate {
    /// Whether the host is playing
    pub is_playing: bool,
    /// Seconds into the current track at `timestamp_ms`
    pub seek_position: f64,
    /// Set when the update carries a track; `None` means unchanged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackRef>,
    /// Host wall-clock time the tuple was recorded (ms since epoch)
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Messages carried by a direct peer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Host → listener playback fan-out
    PlaybackUpdate(PlaybackUpdate),
    /// The sender is closing the channel
    Bye,
}

impl PeerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a received payload
    ///
    /// Unknown message types and malformed payloads yield `None`; the
    /// channel keeps working either way.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let value: serde_json::Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => {
                debug!("Dropping undecodable peer payload: {}", e);
                return None;
            }
        };

        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        if !matches!(tag.as_str(), "playback_update" | "bye") {
            debug!("Ignoring peer message with unknown type {:?}", tag);
            return None;
        }

        match serde_json::from_value(value) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Dropping malformed {} message: {}", tag, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_playback_update_wire_shape() {
        let msg = PeerMessage::PlaybackUpdate(PlaybackUpdate {
            is_playing: true,
            seek_position: 12.5,
            track: None,
            timestamp_ms: 1_700_000_000_000,
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "playback_update",
                "isPlaying": true,
                "seekPosition": 12.5,
                "timestamp": 1_700_000_000_000u64,
            })
        );
    }

    #[test]
    fn test_decode_with_track() {
        let payload = json!({
            "type": "playback_update",
            "isPlaying": false,
            "seekPosition": 3.0,
            "timestamp": 99,
            "track": {
                "id": "t1",
                "title": "Intro",
                "artist": "The Band",
                "locator": "https://cdn.example/t1.mp3",
                "durationSecs": 180.0
            }
        });
        let msg = PeerMessage::decode(payload.to_string().as_bytes()).unwrap();
        match msg {
            PeerMessage::PlaybackUpdate(update) => {
                assert!(!update.is_playing);
                assert_eq!(update.track.map(|t| t.id), Some("t1".to_string()));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed_payloads_are_ignored() {
        assert!(PeerMessage::decode(br#"{"type":"confetti","amount":11}"#).is_none());
        assert!(PeerMessage::decode(br#"{"type":"playback_update","isPlaying":"yes"}"#).is_none());
        assert!(PeerMessage::decode(b"not json").is_none());
        assert!(PeerMessage::decode(br#"{"isPlaying":true}"#).is_none());
        assert_eq!(PeerMessage::decode(br#"{"type":"bye"}"#), Some(PeerMessage::Bye));
    }

    #[test]
    fn test_known_type_with_bad_fields_is_dropped() {
        // Tag is recognised, body is not a playback update
        let payload = json!({
            "type": "playback_update",
            "isPlaying": true,
            "seekPosition": "twelve",
            "timestamp": 5
        });
        assert!(PeerMessage::decode(payload.to_string().as_bytes()).is_none());
    }
}
