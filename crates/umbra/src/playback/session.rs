//! Playback session state machine
//!
//! Owns at most one playback connection. Everything that can change the
//! session (user commands, connection callbacks, focus loss, timer ticks)
//! comes in through `handle`, so transitions are serialized by the caller's
//! single event loop.
//!
//! Connections are numbered. Every teardown bumps the generation, and
//! callbacks tagged with an older generation are dropped, so a connection
//! that is being abandoned can never drive the state of its replacement.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventBus, ServiceEvent, StreamErrorKind};
use crate::focus::{AudioFocus, FocusGrant, FocusLoss};
use crate::routing::{resolve, EffectiveRoute, ProxyKind, RoutingContext, StreamTarget};
use crate::stream::StreamHeaders;

use super::state::{PlaybackState, ReconnectCounter};

/// Progress reported by the backend for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Response received, audio bytes are flowing
    Opened(StreamHeaders),
    /// Renderer ran dry and is waiting for data
    Buffering,
    /// First audio rendered
    Ready,
    Metadata(String),
    Failed(String),
    /// Server closed the stream
    Ended,
    /// Renderer went idle without an error
    Idle,
}

/// Input to the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Play(StreamTarget),
    Pause,
    Resume,
    Stop,
    Connection {
        generation: u64,
        event: ConnectionEvent,
    },
    FocusLost(FocusLoss),
    Tick(Instant),
}

/// The part of playback that touches sockets and audio devices.
///
/// `open` must not block on the network: progress is reported later as
/// `ConnectionEvent`s tagged with `generation`.
pub trait PlaybackBackend: Send {
    fn open(&mut self, generation: u64, target: &StreamTarget, route: &EffectiveRoute)
        -> Result<()>;

    /// Stop rendering and close the connection. Must release everything
    /// before returning.
    fn teardown(&mut self);

    fn pause(&mut self);

    fn resume(&mut self);

    /// Output gain in 0.0..=1.0. Backends without a volume control ignore it.
    fn set_volume(&mut self, _volume: f32) {}
}

/// Resilient playback of one stream target at a time
pub struct PlaybackSession<B: PlaybackBackend, F: AudioFocus> {
    backend: B,
    focus: F,
    routing: Arc<dyn RoutingContext>,
    events: Arc<EventBus>,

    state: PlaybackState,
    counter: ReconnectCounter,
    target: Option<StreamTarget>,
    generation: u64,
    connection_live: bool,
    /// Set while an old connection is being replaced; idle notices are
    /// suppressed until the new connection reports in.
    replacing: bool,
    retry_at: Option<Instant>,
    last_failure: Option<StreamErrorKind>,
    last_title: Option<String>,
    last_flags: (bool, bool),
}

impl<B: PlaybackBackend, F: AudioFocus> PlaybackSession<B, F> {
    pub fn new(backend: B, focus: F, routing: Arc<dyn RoutingContext>, events: Arc<EventBus>) -> Self {
        Self {
            backend,
            focus,
            routing,
            events,
            state: PlaybackState::Idle,
            counter: ReconnectCounter::default(),
            target: None,
            generation: 0,
            connection_live: false,
            replacing: false,
            retry_at: None,
            last_failure: None,
            last_title: None,
            last_flags: (false, false),
        }
    }

    /// Use a different failure budget
    pub fn with_reconnect_counter(mut self, counter: ReconnectCounter) -> Self {
        self.counter = counter;
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_target(&self) -> Option<&StreamTarget> {
        self.target.as_ref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.counter.attempts()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cause of the last `Error` state
    pub fn last_failure(&self) -> Option<StreamErrorKind> {
        self.last_failure
    }

    /// When the pending reconnect fires, if one is scheduled
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.backend.set_volume(volume.clamp(0.0, 1.0));
    }

    /// The single entry point for everything that changes the session
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Play(target) => self.play(target),
            SessionEvent::Pause => self.pause(),
            SessionEvent::Resume => self.resume(),
            SessionEvent::Stop => self.stop(),
            SessionEvent::Connection { generation, event } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, ?event, "Dropping stale connection event");
                    return;
                }
                self.on_connection(event);
            }
            SessionEvent::FocusLost(loss) => self.on_focus_lost(loss),
            SessionEvent::Tick(now) => self.on_tick(now),
        }
    }

    fn play(&mut self, target: StreamTarget) {
        info!(url = %target.url, station = %target.station_name, "Play requested");
        self.counter.reset();
        self.last_failure = None;
        self.target = Some(target);
        self.connect();
    }

    fn pause(&mut self) {
        if matches!(self.state, PlaybackState::Playing | PlaybackState::Buffering) {
            self.backend.pause();
            self.set_state(PlaybackState::Paused);
        }
    }

    fn resume(&mut self) {
        if self.state == PlaybackState::Paused {
            self.backend.resume();
            self.set_state(PlaybackState::Playing);
        }
    }

    fn stop(&mut self) {
        self.retry_at = None;
        self.replacing = false;
        self.teardown_connection();
        self.focus.release();
        self.target = None;
        self.last_title = None;
        if self.state != PlaybackState::Stopped {
            info!("Playback stopped");
        }
        self.set_state(PlaybackState::Stopped);
    }

    /// Full teardown, fresh route, fresh focus request, then open.
    fn connect(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };

        self.retry_at = None;
        self.replacing = true;
        self.teardown_connection();
        self.focus.release();
        self.last_title = None;
        self.set_state(PlaybackState::Connecting);

        let tor = self.routing.tor();
        let route = resolve(&target, &self.routing.policy(), &tor);
        if let EffectiveRoute::Blocked(reason) = route {
            warn!(url = %target.url, %reason, "Playback route blocked");
            self.fail(StreamErrorKind::RouteBlocked(reason));
            return;
        }

        if target.is_i2p() && route.kind() == ProxyKind::I2p && !self.routing.i2p_available() {
            warn!("I2P proxy not detected, trying anyway");
            self.emit(ServiceEvent::StreamError(StreamErrorKind::NetworkUnavailable(
                ProxyKind::I2p,
            )));
        }
        if target.is_onion() && route.kind() == ProxyKind::Tor && !tor.connected {
            warn!("Tor not connected, trying onion service anyway");
            self.emit(ServiceEvent::StreamError(StreamErrorKind::NetworkUnavailable(
                ProxyKind::Tor,
            )));
        }

        if self.focus.acquire() == FocusGrant::Denied {
            warn!("Audio focus denied");
            self.fail(StreamErrorKind::AudioFocusDenied);
            return;
        }

        info!(url = %target.url, %route, generation = self.generation, "Opening stream");
        match self.backend.open(self.generation, &target, &route) {
            Ok(()) => self.connection_live = true,
            Err(e) => self.on_failure(&e.to_string()),
        }
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(headers) => {
                self.replacing = false;
                if headers.bitrate_bps.is_some() || headers.content_type.is_some() {
                    self.emit(ServiceEvent::StreamInfoChanged {
                        bitrate_bps: headers.bitrate_bps,
                        codec: headers.codec().map(str::to_string),
                    });
                }
                if self.state == PlaybackState::Connecting {
                    self.set_state(PlaybackState::Buffering);
                }
            }
            ConnectionEvent::Buffering => {
                self.replacing = false;
                if self.state == PlaybackState::Playing {
                    self.set_state(PlaybackState::Buffering);
                }
            }
            ConnectionEvent::Ready => {
                self.replacing = false;
                if matches!(self.state, PlaybackState::Connecting | PlaybackState::Buffering) {
                    self.set_state(PlaybackState::Playing);
                }
            }
            ConnectionEvent::Metadata(text) => {
                let text = text.trim();
                if !text.is_empty() && self.last_title.as_deref() != Some(text) {
                    self.last_title = Some(text.to_string());
                    self.emit(ServiceEvent::MetadataChanged(text.to_string()));
                }
            }
            ConnectionEvent::Failed(reason) => self.on_failure(&reason),
            ConnectionEvent::Ended => self.on_failure("stream ended"),
            ConnectionEvent::Idle => {
                if self.replacing {
                    debug!("Suppressing idle notice while replacing connection");
                } else {
                    self.notify_flags((false, false));
                }
            }
        }
    }

    fn on_failure(&mut self, reason: &str) {
        if !matches!(
            self.state,
            PlaybackState::Connecting
                | PlaybackState::Buffering
                | PlaybackState::Playing
                | PlaybackState::Paused
        ) {
            return;
        }

        self.replacing = false;
        self.teardown_connection();

        if !self.counter.record_failure() {
            warn!(reason, attempts = self.counter.attempts(), "Giving up on stream");
            self.fail(StreamErrorKind::ReconnectExhausted {
                attempts: self.counter.attempts(),
            });
            return;
        }

        let delay = self.counter.delay();
        warn!(
            reason,
            attempt = self.counter.attempts(),
            max = self.counter.max(),
            delay_ms = delay.as_millis() as u64,
            "Stream failed, reconnecting"
        );
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(PlaybackState::Reconnecting);
    }

    fn on_tick(&mut self, now: Instant) {
        if self.state != PlaybackState::Reconnecting {
            return;
        }
        if self.retry_at.is_some_and(|at| now >= at) {
            self.connect();
        }
    }

    fn on_focus_lost(&mut self, loss: FocusLoss) {
        self.emit(ServiceEvent::AudioFocusLost(loss));
        if loss == FocusLoss::Permanent && self.state.is_active() {
            info!("Audio focus lost permanently, stopping");
            self.stop();
        }
    }

    /// Terminal failure: no retry, focus released, cause recorded and broadcast.
    fn fail(&mut self, kind: StreamErrorKind) {
        self.retry_at = None;
        self.replacing = false;
        self.teardown_connection();
        self.focus.release();
        self.last_failure = Some(kind);
        self.set_state(PlaybackState::Error);
        self.emit(ServiceEvent::StreamError(kind));
    }

    fn teardown_connection(&mut self) {
        if self.connection_live {
            self.backend.teardown();
            self.connection_live = false;
        }
        self.generation += 1;
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Playback state");
        }
        // Every way into Playing counts as a successful connection
        if state == PlaybackState::Playing {
            self.counter.reset();
        }
        self.state = state;
        self.notify_flags(state.flags());
    }

    fn notify_flags(&mut self, flags: (bool, bool)) {
        if flags != self.last_flags {
            self.last_flags = flags;
            self.emit(ServiceEvent::PlaybackStateChanged {
                is_buffering: flags.0,
                is_playing: flags.1,
            });
        }
    }

    fn emit(&self, event: ServiceEvent) {
        self.events.emit(event);
    }
}
