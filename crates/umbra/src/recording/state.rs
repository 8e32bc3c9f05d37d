//! Recording state machine states

use std::fmt;

/// Recording pipeline state, independent of playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Connecting,
    Recording,
    Switching,
    Stopping,
    Completed,
    Failed,
}

impl RecordingState {
    /// Legal transitions. Terminal states may start over.
    pub fn can_transition_to(&self, next: RecordingState) -> bool {
        use RecordingState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Recording)
                | (Connecting, Stopping)
                | (Connecting, Failed)
                | (Recording, Switching)
                | (Recording, Stopping)
                | (Recording, Completed)
                | (Recording, Failed)
                | (Switching, Recording)
                | (Switching, Stopping)
                | (Switching, Failed)
                | (Stopping, Completed)
                | (Stopping, Failed)
                | (Completed, Connecting)
                | (Completed, Idle)
                | (Failed, Connecting)
                | (Failed, Idle)
        )
    }

    /// A worker exists in these states
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingState::Connecting
                | RecordingState::Recording
                | RecordingState::Switching
                | RecordingState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingState::Completed | RecordingState::Failed)
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordingState::Idle => "Idle",
            RecordingState::Connecting => "Connecting",
            RecordingState::Recording => "Recording",
            RecordingState::Switching => "Switching",
            RecordingState::Stopping => "Stopping",
            RecordingState::Completed => "Completed",
            RecordingState::Failed => "Failed",
        };
        f.write_str(s)
    }
}
