//! FFI bindings for native UI integration
//!
//! This module provides the interface exposed via uniffi to Swift/Kotlin.
//! The app supplies its document store, audio element, and signed-in user;
//! everything else runs inside the core.

mod session;
mod store_bridge;
mod types;

pub use session::*;
pub use store_bridge::{ForeignAudio, ForeignStore};
pub use types::*;
