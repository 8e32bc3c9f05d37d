//! Sleep timer
//!
//! A single deadline polled by the service loop. Setting a new timer
//! replaces the old one.

use std::time::{Duration, Instant};

use crate::config::service::{SLEEP_TIMER_MAX_MINUTES, SLEEP_TIMER_MIN_MINUTES};

/// 0 (off) or a duration inside the supported range
pub fn is_valid_duration(minutes: u32) -> bool {
    minutes == 0 || (SLEEP_TIMER_MIN_MINUTES..=SLEEP_TIMER_MAX_MINUTES).contains(&minutes)
}

/// Clamp into `SLEEP_TIMER_MIN_MINUTES..=SLEEP_TIMER_MAX_MINUTES`
pub fn coerce_duration(minutes: u32) -> u32 {
    minutes.clamp(SLEEP_TIMER_MIN_MINUTES, SLEEP_TIMER_MAX_MINUTES)
}

/// "Off", "45 min", "2h" or "1h 30m"
pub fn format_duration(minutes: u32) -> String {
    match (minutes / 60, minutes % 60) {
        (0, 0) => "Off".to_string(),
        (0, m) => format!("{m} min"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

#[derive(Debug, Default)]
pub struct SleepTimer {
    deadline: Option<Instant>,
    minutes: u32,
}

impl SleepTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing any previous one. `0` cancels. Returns the
    /// duration actually used.
    pub fn set(&mut self, minutes: u32, now: Instant) -> u32 {
        if minutes == 0 {
            self.cancel();
            return 0;
        }
        let minutes = coerce_duration(minutes);
        self.minutes = minutes;
        self.deadline = Some(now + Duration::from_secs(u64::from(minutes) * 60));
        minutes
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.minutes = 0;
    }

    pub fn is_set(&self) -> bool {
        self.deadline.is_some()
    }

    /// Duration the timer was armed with, 0 when off
    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline
            .map(|d| d.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// True exactly once, on the first poll at or after the deadline
    pub fn poll_expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.cancel();
                true
            }
            _ => false,
        }
    }
}
