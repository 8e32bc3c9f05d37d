//! Playback session
//!
//! `PlaybackSession` is the state machine. `NetworkBackend` is its real
//! connection/renderer implementation.

pub mod backend;
pub mod session;
pub mod state;

use std::sync::Arc;

pub use backend::NetworkBackend;
pub use session::{ConnectionEvent, PlaybackBackend, PlaybackSession, SessionEvent};
pub use state::{reconnect_delay, PlaybackState, ReconnectCounter};

/// Callback through which connection threads report back, tagged with the
/// generation they were opened for
pub type ConnectionNotifier = Arc<dyn Fn(u64, ConnectionEvent) + Send + Sync>;
