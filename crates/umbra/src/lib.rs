//! Umbra: privacy-aware network audio engine
//!
//! Proxy routing, resilient stream playback and independent stream recording.
//!
//! ## Quick start
//!
//! ```no_run
//! use umbra::playback::{NetworkBackend, PlaybackSession, SessionEvent};
//! use umbra::recording::{HttpConnector, RecordingPipeline};
//! use umbra::routing::{resolve, StreamTarget};
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod focus;
pub mod playback;
pub mod recording;
pub mod routing;
pub mod stream;
