//! Configuration constants for the umbra engine

/// Network-related configuration
pub mod network {
    /// User agent for playback requests
    pub const USER_AGENT: &str = concat!("Umbra/", env!("CARGO_PKG_VERSION"));

    /// User agent for the recording connection
    pub const RECORDER_USER_AGENT: &str = concat!("Umbra-Recorder/", env!("CARGO_PKG_VERSION"));

    /// Connect timeout for direct connections in seconds
    pub const CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Connect timeout when going through a proxy in seconds (Tor circuits are slow to build)
    pub const PROXY_CONNECT_TIMEOUT_SECS: u64 = 60;

    /// Idle connections kept per host. Streams are long-lived, one is enough.
    pub const POOL_MAX_IDLE_PER_HOST: usize = 1;

    /// Idle pooled connections are closed after this many seconds
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 30;

    /// Worker threads of the runtime that drives stream connections
    pub const NET_WORKER_THREADS: usize = 2;

    /// Largest response head read while fetching a proxy challenge (bytes)
    pub const MAX_CHALLENGE_HEAD: usize = 16 * 1024;
}

/// Default anonymizing proxy endpoints
pub mod proxy {
    /// Local I2P HTTP proxy used when an I2P target carries no proxy of its own
    pub const DEFAULT_I2P_HOST: &str = "127.0.0.1";
    pub const DEFAULT_I2P_PORT: u16 = 4444;

    /// Local Tor SOCKS endpoint
    pub const DEFAULT_TOR_HOST: &str = "127.0.0.1";
    pub const DEFAULT_TOR_PORT: u16 = 9050;
}

/// Playback session configuration
pub mod playback {
    /// Consecutive failures tolerated before the session gives up
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

    /// Reconnect backoff grows by this step per attempt (milliseconds)
    pub const RECONNECT_STEP_MS: u64 = 1000;

    /// Upper bound for the reconnect backoff (milliseconds)
    pub const MAX_RECONNECT_DELAY_MS: u64 = 5000;

    /// Maximum time to wait for the decoder probe in seconds
    pub const PROBE_TIMEOUT_SECS: u64 = 10;

    /// Audio chunks buffered between the network pump and the renderer
    pub const AUDIO_CHANNEL_BOUND: usize = 32;

    /// Network read size for the playback pump (bytes)
    pub const READ_CHUNK_SIZE: usize = 8 * 1024;
}

/// Recording pipeline configuration
pub mod recording {
    /// Connect attempts before the recording gives up
    pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

    /// Linear retry step between connect attempts (milliseconds)
    pub const CONNECT_RETRY_STEP_MS: u64 = 1000;

    /// Read chunk size (bytes)
    pub const CHUNK_SIZE: usize = 8 * 1024;

    /// Sink is flushed after this many bytes have been written since the last flush
    pub const FLUSH_THRESHOLD: usize = 64 * 1024;

    /// Buffered writer capacity for file sinks (bytes)
    pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

    /// Chunks buffered between the recording pump and the writer
    pub const CHUNK_CHANNEL_BOUND: usize = 64;

    /// Progress is logged at most this often (seconds)
    pub const PROGRESS_LOG_INTERVAL_SECS: u64 = 10;

    /// Time given to the worker to finish after a stop request (seconds)
    pub const STOP_JOIN_TIMEOUT_SECS: u64 = 5;

    /// Extra time after the interrupt flag is raised (seconds)
    pub const INTERRUPT_JOIN_TIMEOUT_SECS: u64 = 1;

    /// Sub-directory under the music directory for file recordings
    pub const DEFAULT_SUBDIR: &str = "umbra";
}
