//! Stream plumbing
//!
//! Opens cancellable HTTP streams (`http`), moves their bytes onto channels
//! (`pump`), exposes them to the renderer as Read+Seek (`icy`), and parses
//! ICY metadata and headers.

pub mod http;
pub mod icy;
pub mod metadata;
pub mod pump;

pub use http::{open_stream, runtime, HttpBody, TrafficMeter};
pub use icy::{IcyStreamReader, StreamHeaders};
pub use pump::{spawn_pump, Chunk, PumpHandle, PumpOptions, StreamEnd, TitleCallback};
