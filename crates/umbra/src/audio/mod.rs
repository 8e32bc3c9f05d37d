//! Audio output
//!
//! The renderer thread decodes a stream to the default device, or drains it
//! silently on headless builds.

mod renderer;

pub use renderer::{OutputKind, Renderer, RendererHandle};
