//! Outbound notifications
//!
//! `ServiceEvent`s describe everything a front end needs to show: playback
//! state, stream metadata, failures and recording progress. `EventBus`
//! broadcasts them to any number of subscribers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::focus::FocusLoss;
use crate::recording::RecordingState;
use crate::routing::{BlockReason, ProxyKind};

/// Why playback could not continue (or, for `NetworkUnavailable`, a warning)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    RouteBlocked(BlockReason),
    AudioFocusDenied,
    ReconnectExhausted { attempts: u32 },
    /// The anonymity network this target needs does not answer. Playback is
    /// still attempted.
    NetworkUnavailable(ProxyKind),
}

impl StreamErrorKind {
    /// False for warnings that do not stop playback
    pub fn is_fatal(&self) -> bool {
        !matches!(self, StreamErrorKind::NetworkUnavailable(_))
    }
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamErrorKind::RouteBlocked(reason) => write!(f, "{reason}"),
            StreamErrorKind::AudioFocusDenied => write!(f, "Audio output is in use"),
            StreamErrorKind::ReconnectExhausted { attempts } => {
                write!(f, "Stream failed after {attempts} attempts")
            }
            StreamErrorKind::NetworkUnavailable(kind) => {
                write!(f, "{kind} does not appear to be running")
            }
        }
    }
}

/// Discrete events broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    MetadataChanged(String),
    StreamInfoChanged {
        bitrate_bps: Option<u32>,
        codec: Option<String>,
    },
    PlaybackStateChanged {
        is_buffering: bool,
        is_playing: bool,
    },
    StreamError(StreamErrorKind),
    AudioFocusLost(FocusLoss),
    RecordingStateChanged(RecordingState),
    RecordingStarted {
        location: String,
    },
    RecordingError(String),
    RecordingComplete {
        path: PathBuf,
        size_bytes: u64,
    },
    SleepTimerExpired,
    /// Total network bytes received by playback and recording
    TrafficUpdated {
        total_bytes: u64,
    },
}

/// Broadcast mechanism for service events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ServiceEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<ServiceEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: ServiceEvent) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_receive() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.emit(ServiceEvent::MetadataChanged("Song".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServiceEvent::MetadataChanged("Song".into())
        );
    }

    #[test]
    fn multiple_subscribers_each_get_a_copy() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        bus.emit(ServiceEvent::SleepTimerExpired);
        assert_eq!(rx1.try_recv().unwrap(), ServiceEvent::SleepTimerExpired);
        assert_eq!(rx2.try_recv().unwrap(), ServiceEvent::SleepTimerExpired);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe();
        let rx2 = bus.subscribe();
        drop(rx1);
        bus.emit(ServiceEvent::SleepTimerExpired);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(ServiceEvent::RecordingError("x".into()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn network_unavailable_is_not_fatal() {
        assert!(!StreamErrorKind::NetworkUnavailable(ProxyKind::I2p).is_fatal());
        assert!(StreamErrorKind::AudioFocusDenied.is_fatal());
        assert_eq!(
            StreamErrorKind::NetworkUnavailable(ProxyKind::I2p).to_string(),
            "I2P does not appear to be running"
        );
    }
}
