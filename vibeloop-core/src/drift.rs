//! Drift correction for listeners
//!
//! Every playback update a listener receives, from the peer channel or the
//! document store, goes through [`DriftCorrector::offer`]. That is the one
//! place that decides which update is authoritative and the one place that
//! touches the local audio element while a session is active.
//!
//! Correction is event-driven: the listener re-evaluates exactly when new
//! authoritative information arrives (or when the audio element becomes
//! seekable after a track change), never on a timer.

use std::time::Duration;

use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::sync::{PlaybackUpdate, TrackRef};

/// The local audio element as the drift loop needs it
pub trait AudioOutput: Send + Sync {
    /// Current playback position in seconds
    fn current_time(&self) -> f64;
    /// Whether the element is currently playing
    fn is_playing(&self) -> bool;
    fn play(&self);
    fn pause(&self);
    /// Jump to `seconds` into the loaded track
    fn seek_to(&self, seconds: f64);
    /// Start loading a new track; readiness is reported separately
    fn load(&self, track: &TrackRef);
}

/// Which channel delivered an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Durable store subscription
    Store,
    /// Direct peer channel
    Peer,
}

/// The most recently accepted playback tuple
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoritativeSample {
    pub is_playing: bool,
    pub seek_position: f64,
    pub track: Option<TrackRef>,
    pub timestamp_ms: u64,
    pub source: UpdateSource,
}

impl AuthoritativeSample {
    /// Whether an update stamped `timestamp_ms` from `source` supersedes
    /// this sample. Higher timestamps win; on a tie the peer channel wins
    /// over the store.
    pub fn superseded_by(&self, timestamp_ms: u64, source: UpdateSource) -> bool {
        timestamp_ms > self.timestamp_ms
            || (timestamp_ms == self.timestamp_ms
                && source == UpdateSource::Peer
                && self.source == UpdateSource::Store)
    }
}

/// Baseline the drift loop extrapolates from
#[derive(Debug, Clone, PartialEq)]
pub struct DriftSample {
    pub authoritative_seek_position: f64,
    pub authoritative_timestamp_ms: u64,
    pub observed_at_ms: u64,
}

impl DriftSample {
    /// Where the host should be at `now_ms`
    pub fn expected_position(&self, is_playing: bool, now_ms: u64) -> f64 {
        if !is_playing {
            return self.authoritative_seek_position;
        }
        let elapsed_ms = now_ms.saturating_sub(self.authoritative_timestamp_ms);
        self.authoritative_seek_position + elapsed_ms as f64 / 1000.0
    }
}

/// Play/pause change applied during an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayAction {
    Resumed,
    Paused,
}

/// Outcome of one drift evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub expected_position: f64,
    /// Local position read from the audio element, if it was read
    pub actual_position: Option<f64>,
    /// Absolute drift in milliseconds, if measured
    pub drift_ms: Option<f64>,
    /// Position we hard-seeked to
    pub seeked_to: Option<f64>,
    pub play_action: Option<PlayAction>,
    /// Corrections are on hold until the new track is ready to seek
    pub awaiting_ready: bool,
}

/// Result of offering an update
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    /// Older than what we already applied
    Stale,
    /// Accepted and evaluated
    Applied(Evaluation),
}

/// Per-listener drift correction state
#[derive(Debug)]
pub struct DriftCorrector {
    tolerance_ms: f64,
    clock: SharedClock,
    latest: Option<AuthoritativeSample>,
    sample: Option<DriftSample>,
    /// Track currently loaded in the audio element
    loaded_track_id: Option<String>,
    awaiting_ready: bool,
    stopped: bool,
}

impl DriftCorrector {
    pub fn new(tolerance: Duration, clock: SharedClock) -> Self {
        Self {
            tolerance_ms: tolerance.as_millis() as f64,
            clock,
            latest: None,
            sample: None,
            loaded_track_id: None,
            awaiting_ready: false,
            stopped: true,
        }
    }

    /// Begin correcting for a new session
    pub fn start(&mut self) {
        self.reset();
        self.stopped = false;
    }

    /// Stop acting on updates; later offers are ignored
    pub fn stop(&mut self) {
        self.reset();
        self.stopped = true;
    }

    fn reset(&mut self) {
        self.latest = None;
        self.sample = None;
        self.loaded_track_id = None;
        self.awaiting_ready = false;
    }

    pub fn is_running(&self) -> bool {
        !self.stopped
    }

    pub fn latest(&self) -> Option<&AuthoritativeSample> {
        self.latest.as_ref()
    }

    pub fn sample(&self) -> Option<&DriftSample> {
        self.sample.as_ref()
    }

    pub fn is_awaiting_ready(&self) -> bool {
        self.awaiting_ready
    }

    /// Where the host should be right now, extrapolated from the last sample
    pub fn expected_position(&self) -> Option<f64> {
        let latest = self.latest.as_ref()?;
        let sample = self.sample.as_ref()?;
        Some(sample.expected_position(latest.is_playing, self.clock.now_ms()))
    }

    /// Whether an update would replace the current authoritative sample
    pub fn accepts(&self, timestamp_ms: u64, source: UpdateSource) -> bool {
        match &self.latest {
            None => true,
            Some(current) => current.superseded_by(timestamp_ms, source),
        }
    }

    /// Merge an update from either channel and correct if it wins
    pub fn offer(
        &mut self,
        update: &PlaybackUpdate,
        source: UpdateSource,
        audio: &dyn AudioOutput,
    ) -> Offer {
        if self.stopped {
            return Offer::Stale;
        }
        if !self.accepts(update.timestamp_ms, source) {
            debug!(
                "Discarding stale {:?} update (ts {} <= {})",
                source,
                update.timestamp_ms,
                self.latest.as_ref().map(|s| s.timestamp_ms).unwrap_or_default()
            );
            return Offer::Stale;
        }

        let now_ms = self.clock.now_ms();
        let previous_track = self.latest.as_ref().and_then(|s| s.track.clone());
        let track = update.track.clone().or(previous_track);

        // Host timestamps are unique per update, so a tie is the other
        // channel's copy of what we already applied. Keep its baseline.
        let redelivered = self
            .latest
            .as_ref()
            .is_some_and(|s| s.timestamp_ms == update.timestamp_ms);
        if redelivered && self.sample.is_some() {
            debug!("{:?} copy of update {} replaces the earlier copy", source, update.timestamp_ms);
            self.latest = Some(AuthoritativeSample {
                is_playing: update.is_playing,
                seek_position: update.seek_position,
                track,
                timestamp_ms: update.timestamp_ms,
                source,
            });
            return Offer::Applied(self.evaluate(audio));
        }

        let mut baseline = update.seek_position;
        if let Some(new_track) = &update.track {
            if self.loaded_track_id.as_deref() != Some(new_track.id.as_str()) {
                // A listener that already had a track restarts the new one
                // from zero; the first track we learn about uses the
                // reported position so late joiners land mid-track
                if self.loaded_track_id.is_some() {
                    baseline = 0.0;
                }
                info!("Loading track {} ({} - {})", new_track.id, new_track.artist, new_track.title);
                audio.load(new_track);
                self.loaded_track_id = Some(new_track.id.clone());
                self.awaiting_ready = true;
            }
        }

        self.latest = Some(AuthoritativeSample {
            is_playing: update.is_playing,
            seek_position: update.seek_position,
            track,
            timestamp_ms: update.timestamp_ms,
            source,
        });
        self.sample = Some(DriftSample {
            authoritative_seek_position: baseline,
            authoritative_timestamp_ms: update.timestamp_ms,
            observed_at_ms: now_ms,
        });

        Offer::Applied(self.evaluate(audio))
    }

    /// The audio element finished loading and can seek now
    pub fn on_ready_to_seek(&mut self, audio: &dyn AudioOutput) -> Option<Evaluation> {
        if self.stopped || !self.awaiting_ready {
            return None;
        }
        self.awaiting_ready = false;
        self.sample.as_ref()?;
        Some(self.evaluate(audio))
    }

    fn evaluate(&mut self, audio: &dyn AudioOutput) -> Evaluation {
        let now_ms = self.clock.now_ms();
        let (is_playing, expected) = match (&self.latest, &self.sample) {
            (Some(latest), Some(sample)) => (
                latest.is_playing,
                sample.expected_position(latest.is_playing, now_ms),
            ),
            _ => {
                return Evaluation {
                    expected_position: 0.0,
                    actual_position: None,
                    drift_ms: None,
                    seeked_to: None,
                    play_action: None,
                    awaiting_ready: self.awaiting_ready,
                }
            }
        };

        let mut evaluation = Evaluation {
            expected_position: expected,
            actual_position: None,
            drift_ms: None,
            seeked_to: None,
            play_action: None,
            awaiting_ready: self.awaiting_ready,
        };

        if !self.awaiting_ready {
            let actual = audio.current_time();
            // Rounded to the microsecond so the tolerance boundary is exact
            let drift_ms = ((expected - actual).abs() * 1_000_000.0).round() / 1000.0;
            debug!(
                "Sync: drift {:.1}ms (expected: {:.3}s, actual: {:.3}s, tolerance: {}ms)",
                drift_ms, expected, actual, self.tolerance_ms
            );

            if drift_ms > self.tolerance_ms {
                info!(
                    "Drift {:.1}ms exceeds tolerance, seeking {:.3}s -> {:.3}s",
                    drift_ms, actual, expected
                );
                audio.seek_to(expected);
                evaluation.seeked_to = Some(expected);
            }
            evaluation.actual_position = Some(actual);
            evaluation.drift_ms = Some(drift_ms);
        }

        // Play/pause has no tolerance
        let locally_playing = audio.is_playing();
        if is_playing && !locally_playing {
            info!("Host is playing but we're paused, resuming");
            audio.play();
            evaluation.play_action = Some(PlayAction::Resumed);
        } else if !is_playing && locally_playing {
            info!("Host is paused but we're playing, pausing");
            audio.pause();
            evaluation.play_action = Some(PlayAction::Paused);
        }

        evaluation
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Audio element stand-in that records what the drift loop did to it
    #[derive(Debug, Default)]
    pub(crate) struct FakeAudio {
        pub state: Mutex<FakeAudioState>,
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeAudioState {
        pub position: f64,
        pub playing: bool,
        pub seeks: Vec<f64>,
        pub loads: Vec<String>,
    }

    impl FakeAudio {
        pub fn at(position: f64, playing: bool) -> Self {
            let audio = Self::default();
            {
                let mut state = audio.state.lock();
                state.position = position;
                state.playing = playing;
            }
            audio
        }

        pub fn set_position(&self, position: f64) {
            self.state.lock().position = position;
        }

        pub fn seeks(&self) -> Vec<f64> {
            self.state.lock().seeks.clone()
        }

        pub fn loads(&self) -> Vec<String> {
            self.state.lock().loads.clone()
        }

        pub fn playing(&self) -> bool {
            self.state.lock().playing
        }
    }

    impl AudioOutput for FakeAudio {
        fn current_time(&self) -> f64 {
            self.state.lock().position
        }

        fn is_playing(&self) -> bool {
            self.state.lock().playing
        }

        fn play(&self) {
            self.state.lock().playing = true;
        }

        fn pause(&self) {
            self.state.lock().playing = false;
        }

        fn seek_to(&self, seconds: f64) {
            let mut state = self.state.lock();
            state.position = seconds;
            state.seeks.push(seconds);
        }

        fn load(&self, track: &TrackRef) {
            let mut state = self.state.lock();
            state.position = 0.0;
            state.loads.push(track.id.clone());
        }
    }

    pub(crate) fn track(id: &str) -> TrackRef {
        TrackRef {
            id: id.to_string(),
            title: format!("Song {}", id),
            artist: "Artist".to_string(),
            locator: format!("https://cdn.example/{}.mp3", id),
            duration_secs: 240.0,
        }
    }

    fn update(is_playing: bool, seek: f64, track: Option<TrackRef>, ts: u64) -> PlaybackUpdate {
        PlaybackUpdate {
            is_playing,
            seek_position: seek,
            track,
            timestamp_ms: ts,
        }
    }

    fn running(clock: SharedClock) -> DriftCorrector {
        let mut drift = DriftCorrector::new(Duration::from_millis(300), clock);
        drift.start();
        drift
    }

    /// A corrector that has already loaded track `a` and seen it ready
    fn primed(clock: SharedClock, audio: &FakeAudio) -> DriftCorrector {
        let mut drift = running(clock);
        drift.offer(&update(false, 0.0, Some(track("a")), 0), UpdateSource::Store, audio);
        drift.on_ready_to_seek(audio);
        drift
    }

    #[test]
    fn test_threshold_boundaries() {
        let (clock, shared) = ManualClock::shared(10_000);
        for (actual, should_seek) in [(9.699, true), (9.701, false), (9.700, false)] {
            let audio = FakeAudio::at(0.0, false);
            let mut drift = primed(shared.clone(), &audio);
            audio.set_position(actual);
            clock.set(10_000);

            // Paused at 10.0s: drift is exactly 10.0 - actual
            let offer = drift.offer(&update(false, 10.0, None, 10_000), UpdateSource::Store, &audio);
            let Offer::Applied(eval) = offer else { panic!("update should apply") };
            assert_eq!(eval.seeked_to.is_some(), should_seek, "actual = {}", actual);
            assert_eq!(audio.seeks().is_empty(), !should_seek);
        }
    }

    #[test]
    fn test_exactly_at_tolerance_does_not_correct() {
        let (_clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = primed(shared, &audio);
        audio.set_position(4.7);

        let Offer::Applied(eval) = drift.offer(&update(false, 5.0, None, 1), UpdateSource::Store, &audio) else {
            panic!("update should apply")
        };
        assert_eq!(eval.drift_ms, Some(300.0));
        assert!(eval.seeked_to.is_none());
    }

    #[test]
    fn test_paused_expected_position_is_frozen() {
        let (clock, shared) = ManualClock::shared(1_000);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = primed(shared, &audio);
        drift.offer(&update(false, 42.0, None, 1_000), UpdateSource::Store, &audio);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(7));
            assert_eq!(drift.expected_position(), Some(42.0));
        }
    }

    #[test]
    fn test_playing_expected_position_advances_and_never_rewinds() {
        let (clock, shared) = ManualClock::shared(1_000);
        let audio = FakeAudio::at(0.0, true);
        let mut drift = primed(shared, &audio);
        drift.offer(&update(true, 10.0, None, 1_000), UpdateSource::Store, &audio);

        clock.set(3_500);
        assert_eq!(drift.expected_position(), Some(12.5));

        // Host clock ahead of ours: elapsed clamps to zero
        drift.offer(&update(true, 20.0, None, 9_000), UpdateSource::Store, &audio);
        assert_eq!(drift.expected_position(), Some(20.0));
    }

    #[test]
    fn test_late_update_corrects_to_extrapolated_position() {
        // Host updates (true, 5.0) at t=5.0s; it reaches us at t=5.2s while
        // our audio sits at 4.5s
        let (clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, true);
        let mut drift = running(shared);
        drift.offer(&update(true, 0.0, Some(track("a")), 0), UpdateSource::Store, &audio);
        drift.on_ready_to_seek(&audio);

        clock.set(5_200);
        audio.set_position(4.5);
        let Offer::Applied(eval) = drift.offer(&update(true, 5.0, None, 5_000), UpdateSource::Peer, &audio) else {
            panic!("update should apply")
        };

        assert!((eval.expected_position - 5.2).abs() < 1e-9);
        assert_eq!(eval.drift_ms, Some(700.0));
        assert_eq!(eval.seeked_to, Some(eval.expected_position));
        assert!((audio.current_time() - 5.2).abs() < 1e-9);
    }

    #[test]
    fn test_newer_timestamp_wins_in_any_order() {
        let (_clock, shared) = ManualClock::shared(0);
        let older = update(false, 1.0, None, 1_000);
        let newer = update(false, 2.0, None, 2_000);

        let orders = [
            [(older.clone(), UpdateSource::Peer), (newer.clone(), UpdateSource::Store)],
            [(newer.clone(), UpdateSource::Store), (older.clone(), UpdateSource::Peer)],
            [(older.clone(), UpdateSource::Store), (newer.clone(), UpdateSource::Peer)],
            [(newer.clone(), UpdateSource::Peer), (older.clone(), UpdateSource::Store)],
        ];
        for order in orders {
            let audio = FakeAudio::at(0.0, false);
            let mut drift = running(shared.clone());
            for (u, source) in &order {
                drift.offer(u, *source, &audio);
            }
            let latest = drift.latest().unwrap();
            assert_eq!(latest.timestamp_ms, 2_000);
            assert_eq!(latest.seek_position, 2.0);
        }
    }

    #[test]
    fn test_tie_prefers_peer_channel() {
        let (_clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = running(shared);

        let from_store = update(false, 1.0, None, 1_000);
        let from_peer = update(true, 1.5, None, 1_000);

        assert!(matches!(drift.offer(&from_store, UpdateSource::Store, &audio), Offer::Applied(_)));
        assert!(matches!(drift.offer(&from_peer, UpdateSource::Peer, &audio), Offer::Applied(_)));
        assert_eq!(drift.latest().unwrap().source, UpdateSource::Peer);

        // The durable copy of the same update arrives late and is dropped
        assert_eq!(drift.offer(&from_store, UpdateSource::Store, &audio), Offer::Stale);
        assert!(drift.latest().unwrap().is_playing);
    }

    #[test]
    fn test_play_state_applies_regardless_of_drift() {
        let (_clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = primed(shared, &audio);

        let Offer::Applied(eval) = drift.offer(&update(true, 0.0, None, 1), UpdateSource::Store, &audio) else {
            panic!("update should apply")
        };
        assert!(eval.seeked_to.is_none());
        assert_eq!(eval.play_action, Some(PlayAction::Resumed));
        assert!(audio.playing());

        let Offer::Applied(eval) = drift.offer(&update(false, 0.0, None, 2), UpdateSource::Store, &audio) else {
            panic!("update should apply")
        };
        assert_eq!(eval.play_action, Some(PlayAction::Paused));
        assert!(!audio.playing());
    }

    #[test]
    fn test_track_change_resets_baseline_and_waits_for_ready() {
        let (clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, true);
        let mut drift = primed(shared, &audio);
        drift.offer(&update(true, 95.0, None, 100), UpdateSource::Store, &audio);

        clock.set(1_000);
        let Offer::Applied(eval) = drift.offer(&update(true, 95.9, Some(track("b")), 1_000), UpdateSource::Peer, &audio) else {
            panic!("update should apply")
        };
        assert_eq!(audio.loads(), vec!["a".to_string(), "b".to_string()]);
        assert!(eval.awaiting_ready);
        assert!(eval.seeked_to.is_none());
        assert_eq!(drift.sample().unwrap().authoritative_seek_position, 0.0);

        // Not ready yet: further updates for the same track don't seek either
        audio.set_position(0.0);
        clock.set(2_000);
        assert!(drift.is_awaiting_ready());

        // Ready two seconds after the switch: expected is 1.0s, actual 0.0s
        let eval = drift.on_ready_to_seek(&audio).unwrap();
        assert!((eval.expected_position - 1.0).abs() < 1e-9);
        assert_eq!(eval.seeked_to, Some(eval.expected_position));
    }

    #[test]
    fn test_first_track_uses_reported_position() {
        let (clock, shared) = ManualClock::shared(60_000);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = running(shared);

        drift.offer(&update(true, 30.0, Some(track("a")), 50_000), UpdateSource::Store, &audio);
        assert_eq!(drift.sample().unwrap().authoritative_seek_position, 30.0);

        clock.set(60_000);
        let eval = drift.on_ready_to_seek(&audio).unwrap();
        assert!((eval.expected_position - 40.0).abs() < 1e-9);
        assert_eq!(audio.seeks().len(), 1);
    }

    #[test]
    fn test_track_change_baseline_independent_of_arrival_order() {
        let (clock, shared) = ManualClock::shared(0);
        let change = update(true, 30.0, Some(track("b")), 1_000);

        let orders = [
            [UpdateSource::Peer, UpdateSource::Store],
            [UpdateSource::Store, UpdateSource::Peer],
        ];
        let mut outcomes = Vec::new();
        for order in orders {
            clock.set(0);
            let audio = FakeAudio::at(0.0, true);
            let mut drift = primed(shared.clone(), &audio);

            clock.set(1_000);
            for source in order {
                drift.offer(&change, source, &audio);
            }
            assert_eq!(drift.latest().unwrap().source, UpdateSource::Peer);

            clock.set(3_000);
            let eval = drift.on_ready_to_seek(&audio).unwrap();
            outcomes.push((
                drift.sample().unwrap().authoritative_seek_position,
                eval.seeked_to,
                audio.loads(),
            ));
        }

        assert_eq!(outcomes[0], outcomes[1]);
        // Restarted from zero, two seconds in
        assert_eq!(outcomes[0].0, 0.0);
        assert_eq!(outcomes[0].1, Some(2.0));
        assert_eq!(outcomes[0].2, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_stopped_corrector_ignores_everything() {
        let (_clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, false);
        let mut drift = primed(shared, &audio);
        drift.stop();

        // Whatever the user does locally stays untouched
        audio.play();
        audio.set_position(3.0);
        let seeks_before = audio.seeks().len();

        assert_eq!(drift.offer(&update(false, 99.0, None, 5), UpdateSource::Peer, &audio), Offer::Stale);
        assert_eq!(
            drift.offer(&update(false, 0.0, Some(track("z")), 6), UpdateSource::Store, &audio),
            Offer::Stale
        );
        assert!(drift.on_ready_to_seek(&audio).is_none());
        assert!(audio.playing());
        assert_eq!(audio.current_time(), 3.0);
        assert_eq!(audio.seeks().len(), seeks_before);
        assert_eq!(audio.loads(), vec!["a".to_string()]);
    }

    #[test]
    fn test_keeps_extrapolating_without_updates() {
        let (clock, shared) = ManualClock::shared(0);
        let audio = FakeAudio::at(0.0, true);
        let mut drift = primed(shared, &audio);
        drift.offer(&update(true, 0.0, None, 1), UpdateSource::Store, &audio);

        clock.set(600_001);
        assert_eq!(drift.expected_position(), Some(600.0));
    }

    #[test]
    fn test_shared_audio_handle_is_object_safe() {
        let audio: Arc<dyn AudioOutput> = Arc::new(FakeAudio::default());
        assert_eq!(audio.current_time(), 0.0);
    }
}
