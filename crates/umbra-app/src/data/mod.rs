//! Data persistence
//!
//! JSON storage in the user config directory and the user's settings.

pub mod settings;
pub mod storage;

pub use settings::{ForceMode, RecordingStorage, Settings};
pub use storage::{config_dir, load, save};
