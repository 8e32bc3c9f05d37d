//! Error types for Umbra app services
//!
//! Application-level errors that wrap engine errors and add app-specific variants.

use thiserror::Error;
use umbra::error::RadioError;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] RadioError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The streaming service thread is gone or could not be started
    #[error("Service error: {0}")]
    Service(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Engine(RadioError::Network(e))
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Engine(RadioError::Io(e))
    }
}

/// Result type alias for Umbra app services
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_are_transparent() {
        let err: AppError = RadioError::AudioFocusDenied.into();
        assert_eq!(err.to_string(), "Audio focus denied");
    }

    #[test]
    fn io_errors_wrap_into_engine() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, AppError::Engine(RadioError::Io(_))));
    }
}
