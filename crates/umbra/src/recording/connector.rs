//! Recording connections

use std::fmt;
use std::io::Read;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{friendly_network_error, RadioError};
use crate::routing::{ClientPurpose, EffectiveRoute, StreamTarget};
use crate::stream::{open_stream, HttpBody, TrafficMeter};

/// Why a connect attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Timeout or refused connection; worth retrying
    Transient(String),
    /// Bad status, bad URL, blocked route; retrying will not help
    Hard(String),
    /// The attempt was called off before the stream opened
    Cancelled,
}

impl ConnectError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ConnectError::Transient(m) | ConnectError::Hard(m) => m,
            ConnectError::Cancelled => "Connection cancelled",
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<RadioError> for ConnectError {
    fn from(e: RadioError) -> Self {
        match e {
            RadioError::Network(e) if e.is_timeout() || e.is_connect() => {
                ConnectError::Transient(friendly_network_error(&e))
            }
            other => ConnectError::Hard(other.to_string()),
        }
    }
}

/// Opens the byte stream a recording reads from.
///
/// Cancelling `cancel` must abort a pending connect and end reads on the
/// returned stream, closing its connection.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        target: &StreamTarget,
        route: &EffectiveRoute,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn Read + Send>, ConnectError>;
}

/// HTTP(S) connector. Every call builds a fresh client, so recording never
/// shares a connection pool with playback or with an earlier attempt.
#[derive(Debug, Default, Clone)]
pub struct HttpConnector {
    meter: TrafficMeter,
}

impl HttpConnector {
    /// Count received bytes on `meter`
    pub fn with_meter(meter: TrafficMeter) -> Self {
        Self { meter }
    }
}

impl Connector for HttpConnector {
    fn connect(
        &self,
        target: &StreamTarget,
        route: &EffectiveRoute,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn Read + Send>, ConnectError> {
        debug!(url = %target.url, %route, "Recording connect");
        let response = open_stream(
            route,
            ClientPurpose::Recording,
            &target.url,
            &[("Icy-MetaData", "0"), ("Accept", "*/*")],
            cancel,
        )?
        .ok_or(ConnectError::Cancelled)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectError::Hard(format!("HTTP {status}")));
        }
        Ok(Box::new(HttpBody::new(response, cancel.clone(), self.meter.clone())))
    }
}
