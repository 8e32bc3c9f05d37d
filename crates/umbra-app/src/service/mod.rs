//! Streaming service
//!
//! One command queue, one thread: playback, recording and the sleep timer
//! are all driven from `StreamingService::run`.

pub mod commands;
pub mod controller;
pub mod sleep_timer;

pub use commands::{ServiceCommand, ServiceSnapshot};
pub use controller::{ServiceHandle, ServiceParts, StreamingService};
pub use sleep_timer::{coerce_duration, format_duration, is_valid_duration, SleepTimer};
