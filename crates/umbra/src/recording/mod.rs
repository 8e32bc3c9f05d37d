//! Stream recording
//!
//! `RecordingPipeline` runs one recording at a time on a worker thread,
//! independent of playback. Storage is pluggable through `StorageBackend`.

pub mod connector;
pub mod naming;
pub mod pipeline;
pub mod sink;
pub mod state;

pub use connector::{ConnectError, Connector, HttpConnector};
pub use naming::{recording_file_name, sanitize_station_name, StreamFormat};
pub use pipeline::RecordingPipeline;
pub use sink::{
    DirectoryStorage, FileStorage, MediaEntry, MediaIndexStorage, RecordingSink, SavedRecording,
    StorageBackend,
};
pub use state::RecordingState;
/// Passed to `Connector::connect`
pub use tokio_util::sync::CancellationToken;
