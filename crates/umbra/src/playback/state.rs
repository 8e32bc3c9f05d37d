//! Playback state types

use std::fmt;
use std::time::Duration;

use crate::config::playback::{MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY_MS, RECONNECT_STEP_MS};

/// Playback session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Connecting,
    Buffering,
    Playing,
    Paused,
    Reconnecting,
    Error,
    Stopped,
}

impl PlaybackState {
    /// States in which a connection (or a pending one) exists
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackState::Connecting
                | PlaybackState::Buffering
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Reconnecting
        )
    }

    /// `(is_buffering, is_playing)` as broadcast to front ends
    pub fn flags(&self) -> (bool, bool) {
        match self {
            PlaybackState::Connecting | PlaybackState::Buffering | PlaybackState::Reconnecting => {
                (true, false)
            }
            PlaybackState::Playing => (false, true),
            _ => (false, false),
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "Idle"),
            PlaybackState::Connecting => write!(f, "Connecting"),
            PlaybackState::Buffering => write!(f, "Buffering"),
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Paused => write!(f, "Paused"),
            PlaybackState::Reconnecting => write!(f, "Reconnecting"),
            PlaybackState::Error => write!(f, "Error"),
            PlaybackState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Consecutive playback failures for the current target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectCounter {
    attempts: u32,
    max: u32,
}

impl Default for ReconnectCounter {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS)
    }
}

impl ReconnectCounter {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Count one failure. Returns false once the budget is spent; the
    /// counter never goes past `max`.
    pub fn record_failure(&mut self) -> bool {
        if self.attempts < self.max {
            self.attempts += 1;
        }
        self.attempts < self.max
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Backoff before the next attempt: `min(step * attempts, cap)`
    pub fn delay(&self) -> Duration {
        reconnect_delay(self.attempts)
    }
}

/// Backoff for the given failure count: 1s, 2s, 3s, 4s, 5s, 5s, ...
pub fn reconnect_delay(attempts: u32) -> Duration {
    let ms = RECONNECT_STEP_MS.saturating_mul(u64::from(attempts));
    Duration::from_millis(ms.min(MAX_RECONNECT_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- PlaybackState ---

    #[test]
    fn default_is_idle() {
        assert_eq!(PlaybackState::default(), PlaybackState::Idle);
    }

    #[test]
    fn flags_per_state() {
        assert_eq!(PlaybackState::Connecting.flags(), (true, false));
        assert_eq!(PlaybackState::Reconnecting.flags(), (true, false));
        assert_eq!(PlaybackState::Playing.flags(), (false, true));
        assert_eq!(PlaybackState::Paused.flags(), (false, false));
        assert_eq!(PlaybackState::Error.flags(), (false, false));
    }

    #[test]
    fn active_states() {
        assert!(PlaybackState::Reconnecting.is_active());
        assert!(PlaybackState::Paused.is_active());
        assert!(!PlaybackState::Stopped.is_active());
        assert!(!PlaybackState::Error.is_active());
        assert!(!PlaybackState::Idle.is_active());
    }

    #[test]
    fn display() {
        assert_eq!(PlaybackState::Reconnecting.to_string(), "Reconnecting");
    }

    // --- ReconnectCounter ---

    #[test]
    fn counter_is_monotonic_until_max() {
        let mut c = ReconnectCounter::new(3);
        assert!(c.record_failure());
        assert!(c.record_failure());
        assert!(!c.record_failure());
        assert_eq!(c.attempts(), 3);
        assert!(!c.record_failure());
        assert_eq!(c.attempts(), 3, "never exceeds max");
        assert!(c.exhausted());
    }

    #[test]
    fn counter_reset() {
        let mut c = ReconnectCounter::default();
        c.record_failure();
        c.record_failure();
        c.reset();
        assert_eq!(c.attempts(), 0);
        assert_eq!(c.max(), 10);
        assert!(!c.exhausted());
    }

    #[test]
    fn delay_grows_linearly_then_caps() {
        assert_eq!(reconnect_delay(0), Duration::ZERO);
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(3), Duration::from_secs(3));
        assert_eq!(reconnect_delay(5), Duration::from_secs(5));
        assert_eq!(reconnect_delay(9), Duration::from_secs(5));
        assert_eq!(reconnect_delay(u32::MAX), Duration::from_secs(5));
    }
}
