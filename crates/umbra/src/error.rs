//! Error types for Umbra
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::routing::BlockReason;

/// Main error type for the umbra engine
#[derive(Error, Debug)]
pub enum RadioError {
    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    /// The anonymity policy forbids every route for this target.
    #[error("Route blocked: {0}")]
    RouteBlocked(BlockReason),

    #[error("Audio focus denied")]
    AudioFocusDenied,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("Recording connection failed: {0}")]
    RecordingConnect(String),

    #[error("A recording is already in progress")]
    RecordingInProgress,

    #[error("Recording write failed: {0}")]
    RecordingWrite(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type alias for Umbra
pub type Result<T> = std::result::Result<T, RadioError>;

pub(crate) fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL or proxy configuration".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    if e.is_decode() {
        return "Invalid response from server".to_string();
    }
    format!("Network error: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_blocked_names_the_reason() {
        let err = RadioError::RouteBlocked(BlockReason::TorNotConnected);
        assert_eq!(err.to_string(), "Route blocked: Tor is required but not connected");
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: RadioError = io.into();
        assert!(matches!(err, RadioError::Io(_)));
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn reconnect_exhausted_message() {
        assert_eq!(
            RadioError::ReconnectExhausted(10).to_string(),
            "Gave up after 10 reconnect attempts"
        );
    }
}
