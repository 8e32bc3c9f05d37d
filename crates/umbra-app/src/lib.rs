//! Umbra App Services
//!
//! Persisted settings, Tor/I2P connectivity monitors and the streaming
//! service that drives playback and recording from one command queue.
//! Depends on the `umbra` engine crate.

pub mod config;
pub mod connectivity;
pub mod data;
pub mod error;
pub mod service;
