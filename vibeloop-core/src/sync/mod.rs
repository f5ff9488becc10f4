//! Sync Model
//!
//! Wire messages, the session document, and the session lifecycle states.

mod protocol;
mod session_id;
mod state;

pub use protocol::*;
pub use session_id::SessionId;
pub use state::*;
