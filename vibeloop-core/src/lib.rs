//! VibeLoop Core Library
//!
//! Co-listening sessions: one host drives a shared playback timeline and
//! every listener's audio element follows it. State lives in a document
//! store that all clients subscribe to; a direct peer channel carries the
//! same updates with lower latency when it can be negotiated.

pub mod chat;
pub mod clock;
pub mod config;
pub mod drift;
pub mod ffi;
pub mod identity;
pub mod janitor;
pub mod peer;
pub mod session;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use config::SessionConfig;
pub use drift::{AudioOutput, DriftCorrector};
pub use session::{CoListenSession, SessionError};
pub use store::{DocumentStore, MemoryStore, StoreError};
pub use sync::{SessionId, SessionRecord, SessionSnapshot, TrackRef};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
