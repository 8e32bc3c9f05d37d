//! Service commands and the shared state snapshot
//!
//! `ServiceCommand` is the single command type every front end sends.
//! Connection progress and focus loss come back into the same queue, so the
//! service processes everything in order on one thread.

use umbra::focus::FocusLoss;
use umbra::playback::{ConnectionEvent, PlaybackState};
use umbra::recording::RecordingState;
use umbra::routing::StreamTarget;

/// Commands sent by any front end
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    // Playback
    Play(StreamTarget),
    Pause,
    Resume,
    /// Stops playback and recording and cancels the sleep timer
    Stop,
    SetVolume(f32),

    // Recording
    /// Record the stream that is playing. An empty name keeps the station's.
    StartRecording {
        station_name: String,
    },
    StopRecording,
    /// Continue the current recording file from another stream
    SwitchRecordingStream(StreamTarget),

    // Sleep timer
    SetSleepTimer {
        minutes: u32,
    },
    CancelSleepTimer,

    Shutdown,

    // Internal: reported by connection threads and the focus arbiter
    Connection {
        generation: u64,
        event: ConnectionEvent,
    },
    FocusLost(FocusLoss),
}

/// Snapshot of service state, shared with front ends
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSnapshot {
    pub playback: PlaybackState,
    pub recording: RecordingState,
    pub station_name: Option<String>,
    pub stream_url: Option<String>,
    /// Last stream title announced by the server
    pub title: Option<String>,
    pub bitrate_bps: Option<u32>,
    pub codec: Option<String>,
    pub volume: f32,
    pub reconnect_attempts: u32,
    /// Sleep timer duration, 0 when off
    pub sleep_timer_minutes: u32,
    pub sleep_timer_remaining_secs: u64,
    pub recording_location: Option<String>,
    pub recording_bytes: u64,
    /// Network bytes received since the service started
    pub network_bytes: u64,
    /// Last playback or recording error
    pub last_error: Option<String>,
}

impl Default for ServiceSnapshot {
    fn default() -> Self {
        Self {
            playback: PlaybackState::Idle,
            recording: RecordingState::Idle,
            station_name: None,
            stream_url: None,
            title: None,
            bitrate_bps: None,
            codec: None,
            volume: 1.0,
            reconnect_attempts: 0,
            sleep_timer_minutes: 0,
            sleep_timer_remaining_secs: 0,
            recording_location: None,
            recording_bytes: 0,
            network_bytes: 0,
            last_error: None,
        }
    }
}

impl ServiceSnapshot {
    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_active()
    }
}
