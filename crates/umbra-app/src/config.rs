//! Configuration constants for umbra app services

/// Application metadata
pub mod app {
    /// Application name (used for config directory, etc.)
    pub const NAME: &str = "umbra";

    /// Settings file inside the config directory
    pub const SETTINGS_FILE: &str = "settings.json";
}

/// Streaming service configuration
pub mod service {
    /// Command loop wake-up interval in milliseconds
    pub const TICK_MS: u64 = 50;

    /// Shortest sleep timer in minutes
    pub const SLEEP_TIMER_MIN_MINUTES: u32 = 1;

    /// Longest sleep timer in minutes (12 hours)
    pub const SLEEP_TIMER_MAX_MINUTES: u32 = 720;

    /// Minimum spacing of traffic events in milliseconds
    pub const TRAFFIC_EVENT_INTERVAL_MS: u64 = 1000;
}

/// Anonymity network health checks
pub mod connectivity {
    /// TCP probe timeout in milliseconds
    pub const PROBE_TIMEOUT_MS: u64 = 2000;

    /// Interval between probes in seconds
    pub const CHECK_INTERVAL_SECS: u64 = 30;
}
