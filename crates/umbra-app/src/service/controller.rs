//! Streaming service
//!
//! Owns the playback session, the recording pipeline and the sleep timer,
//! and processes commands from every front end through a single crossbeam
//! channel on one thread. Connection threads and the focus arbiter report
//! back through the same channel, so nothing here needs a lock except the
//! published snapshot.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use umbra::events::{EventBus, ServiceEvent};
use umbra::focus::{FocusArbiter, FocusClient};
use umbra::playback::{ConnectionNotifier, PlaybackBackend, PlaybackSession, SessionEvent};
use umbra::recording::{Connector, HttpConnector, RecordingPipeline};
use umbra::routing::{RoutingContext, StreamTarget};
use umbra::stream::TrafficMeter;

use crate::config::service::{TICK_MS, TRAFFIC_EVENT_INTERVAL_MS};
use crate::data::Settings;
use crate::error::{AppError, Result};

use super::commands::{ServiceCommand, ServiceSnapshot};
use super::sleep_timer::SleepTimer;

/// Collaborators the service is assembled from
pub struct ServiceParts {
    pub settings: Arc<Mutex<Settings>>,
    pub routing: Arc<dyn RoutingContext>,
    pub arbiter: FocusArbiter,
    pub connector: Arc<dyn Connector>,
    pub events: Arc<EventBus>,
    /// Shared by the recording connector and, when the front end passes it
    /// on, the playback backend
    pub traffic: TrafficMeter,
}

impl ServiceParts {
    /// Real HTTP recording, a private focus arbiter and a fresh event bus
    pub fn new(settings: Arc<Mutex<Settings>>, routing: Arc<dyn RoutingContext>) -> Self {
        let traffic = TrafficMeter::new();
        Self {
            settings,
            routing,
            arbiter: FocusArbiter::new(),
            connector: Arc::new(HttpConnector::with_meter(traffic.clone())),
            events: Arc::new(EventBus::new()),
            traffic,
        }
    }
}

/// Cloneable front-end side of a running service
#[derive(Clone)]
pub struct ServiceHandle {
    cmd_tx: Sender<ServiceCommand>,
    events: Arc<EventBus>,
    snapshot: Arc<Mutex<ServiceSnapshot>>,
}

impl ServiceHandle {
    pub fn send(&self, cmd: ServiceCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| AppError::Service("streaming service has shut down".to_string()))
    }

    pub fn play(&self, target: StreamTarget) -> Result<()> {
        self.send(ServiceCommand::Play(target))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(ServiceCommand::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(ServiceCommand::Resume)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ServiceCommand::Stop)
    }

    pub fn set_volume(&self, volume: f32) -> Result<()> {
        self.send(ServiceCommand::SetVolume(volume))
    }

    pub fn start_recording(&self, station_name: impl Into<String>) -> Result<()> {
        self.send(ServiceCommand::StartRecording {
            station_name: station_name.into(),
        })
    }

    pub fn stop_recording(&self) -> Result<()> {
        self.send(ServiceCommand::StopRecording)
    }

    pub fn switch_recording_stream(&self, target: StreamTarget) -> Result<()> {
        self.send(ServiceCommand::SwitchRecordingStream(target))
    }

    pub fn set_sleep_timer(&self, minutes: u32) -> Result<()> {
        self.send(ServiceCommand::SetSleepTimer { minutes })
    }

    pub fn cancel_sleep_timer(&self) -> Result<()> {
        self.send(ServiceCommand::CancelSleepTimer)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(ServiceCommand::Shutdown)
    }

    pub fn subscribe(&self) -> Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub struct StreamingService<B: PlaybackBackend> {
    cmd_rx: Receiver<ServiceCommand>,
    session: PlaybackSession<B, FocusClient>,
    recorder: RecordingPipeline,
    settings: Arc<Mutex<Settings>>,
    events: Arc<EventBus>,
    /// Own subscription, used to keep the snapshot's title and errors current
    event_rx: Receiver<ServiceEvent>,
    sleep_timer: SleepTimer,
    traffic: TrafficMeter,
    /// Total and time of the last `TrafficUpdated`
    traffic_reported: (u64, Option<Instant>),
    view: ServiceSnapshot,
    shared: Arc<Mutex<ServiceSnapshot>>,
}

impl<B: PlaybackBackend + 'static> StreamingService<B> {
    /// Assemble the service. `make_backend` receives the notifier its
    /// connection threads must report through.
    pub fn new<F>(parts: ServiceParts, make_backend: F) -> Result<(Self, ServiceHandle)>
    where
        F: FnOnce(ConnectionNotifier) -> umbra::error::Result<B>,
    {
        let (cmd_tx, cmd_rx) = unbounded();

        let conn_tx = cmd_tx.clone();
        let notify: ConnectionNotifier = Arc::new(move |generation, event| {
            let _ = conn_tx.send(ServiceCommand::Connection { generation, event });
        });
        let backend = make_backend(notify)?;

        let focus_tx = cmd_tx.clone();
        let focus = parts.arbiter.client(move |loss| {
            let _ = focus_tx.send(ServiceCommand::FocusLost(loss));
        });

        let mut session = PlaybackSession::new(
            backend,
            focus,
            parts.routing.clone(),
            parts.events.clone(),
        );
        let volume = parts
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .volume;
        session.set_volume(volume);

        let recorder = RecordingPipeline::new(parts.routing, parts.connector, parts.events.clone());
        let view = ServiceSnapshot {
            volume,
            ..ServiceSnapshot::default()
        };
        let shared = Arc::new(Mutex::new(view.clone()));

        let handle = ServiceHandle {
            cmd_tx,
            events: parts.events.clone(),
            snapshot: shared.clone(),
        };
        let service = Self {
            cmd_rx,
            session,
            recorder,
            settings: parts.settings,
            event_rx: parts.events.subscribe(),
            events: parts.events,
            sleep_timer: SleepTimer::new(),
            traffic: parts.traffic,
            traffic_reported: (0, None),
            view,
            shared,
        };
        Ok((service, handle))
    }

    /// Run the loop on a `streaming-service` thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let thread = thread::Builder::new()
            .name("streaming-service".into())
            .spawn(move || self.run())?;
        Ok(thread)
    }

    /// Process commands until `Shutdown` (blocking, call from a dedicated thread)
    pub fn run(mut self) {
        info!("Streaming service started");
        loop {
            match self.cmd_rx.recv_timeout(Duration::from_millis(TICK_MS)) {
                Ok(cmd) => {
                    if self.handle_command(cmd) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.tick(Instant::now());
            self.publish();
        }

        self.stop_all();
        self.publish();
        info!("Streaming service stopped");
    }

    /// Handle a single command. Returns true if the loop should exit.
    fn handle_command(&mut self, cmd: ServiceCommand) -> bool {
        match cmd {
            ServiceCommand::Shutdown => return true,

            ServiceCommand::Play(target) => self.session.handle(SessionEvent::Play(target)),
            ServiceCommand::Pause => self.session.handle(SessionEvent::Pause),
            ServiceCommand::Resume => self.session.handle(SessionEvent::Resume),
            ServiceCommand::Stop => self.stop_all(),
            ServiceCommand::SetVolume(volume) => {
                let volume = volume.clamp(0.0, 1.0);
                self.settings
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_volume(volume);
                self.session.set_volume(volume);
                self.view.volume = volume;
            }

            ServiceCommand::StartRecording { station_name } => self.start_recording(station_name),
            ServiceCommand::StopRecording => {
                if !self.recorder.stop() {
                    debug!("Stop recording requested but nothing is recording");
                }
            }
            ServiceCommand::SwitchRecordingStream(target) => {
                let url = target.url.clone();
                if self.recorder.switch_stream(target) {
                    info!(%url, "Recording will continue from new stream");
                } else {
                    debug!(%url, "Switch requested but nothing is recording");
                }
            }

            ServiceCommand::SetSleepTimer { minutes } => {
                let minutes = self.sleep_timer.set(minutes, Instant::now());
                info!(minutes, "Sleep timer set");
            }
            ServiceCommand::CancelSleepTimer => self.sleep_timer.cancel(),

            ServiceCommand::Connection { generation, event } => {
                self.session
                    .handle(SessionEvent::Connection { generation, event });
            }
            ServiceCommand::FocusLost(loss) => self.session.handle(SessionEvent::FocusLost(loss)),
        }
        false
    }

    fn start_recording(&mut self, station_name: String) {
        let Some(mut target) = self.session.current_target().cloned() else {
            warn!("Recording requested with nothing playing");
            self.events
                .emit(ServiceEvent::RecordingError("No stream is playing".to_string()));
            return;
        };
        if !station_name.trim().is_empty() {
            target.station_name = station_name;
        }

        let storage = self
            .settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .storage_backend();
        let result = match storage {
            Ok(storage) => self.recorder.start(target, storage).map_err(AppError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(error = %e, "Could not start recording");
            self.events.emit(ServiceEvent::RecordingError(e.to_string()));
        }
    }

    fn stop_all(&mut self) {
        self.session.handle(SessionEvent::Stop);
        self.recorder.stop();
        self.sleep_timer.cancel();
    }

    fn tick(&mut self, now: Instant) {
        self.session.handle(SessionEvent::Tick(now));
        if self.sleep_timer.poll_expired(now) {
            info!("Sleep timer expired, stopping");
            self.stop_all();
            self.events.emit(ServiceEvent::SleepTimerExpired);
        }
        self.recorder.reap();
    }

    /// Fold new events into the view and publish it
    fn publish(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                ServiceEvent::MetadataChanged(title) => self.view.title = Some(title),
                ServiceEvent::StreamInfoChanged { bitrate_bps, codec } => {
                    self.view.bitrate_bps = bitrate_bps;
                    self.view.codec = codec;
                }
                ServiceEvent::StreamError(kind) if kind.is_fatal() => {
                    self.view.last_error = Some(kind.to_string());
                }
                ServiceEvent::RecordingError(message) => self.view.last_error = Some(message),
                _ => {}
            }
        }

        let now = Instant::now();
        let target = self.session.current_target();
        if target.is_none() {
            self.view.title = None;
            self.view.bitrate_bps = None;
            self.view.codec = None;
        }
        self.view.playback = self.session.state();
        self.view.station_name = target.map(|t| t.station_name.clone());
        self.view.stream_url = target.map(|t| t.url.clone());
        self.view.reconnect_attempts = self.session.reconnect_attempts();
        self.view.recording = self.recorder.state();
        self.view.recording_location = self.recorder.location();
        self.view.recording_bytes = self.recorder.bytes_written();
        self.view.sleep_timer_minutes = self.sleep_timer.minutes();
        self.view.sleep_timer_remaining_secs = self.sleep_timer.remaining(now).as_secs();
        self.view.network_bytes = self.traffic.total();
        self.report_traffic(now);

        *self.shared.lock().unwrap_or_else(|e| e.into_inner()) = self.view.clone();
    }

    fn report_traffic(&mut self, now: Instant) {
        let total = self.view.network_bytes;
        let (reported, at) = self.traffic_reported;
        let due = match at {
            Some(at) => now.duration_since(at) >= Duration::from_millis(TRAFFIC_EVENT_INTERVAL_MS),
            None => true,
        };
        if total != reported && due {
            self.events.emit(ServiceEvent::TrafficUpdated { total_bytes: total });
            self.traffic_reported = (total, Some(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use umbra::focus::{AudioFocus, FocusLoss};
    use umbra::playback::{ConnectionEvent, PlaybackState};
    use umbra::recording::{CancellationToken, ConnectError, RecordingState};
    use umbra::routing::{EffectiveRoute, StaticRouting};
    use umbra::stream::StreamHeaders;

    use crate::data::RecordingStorage;

    /// Reports Opened and Ready as soon as a connection is opened
    struct LoopbackBackend {
        notify: ConnectionNotifier,
        opens: Arc<Mutex<u32>>,
        volume: Arc<Mutex<f32>>,
    }

    impl PlaybackBackend for LoopbackBackend {
        fn open(
            &mut self,
            generation: u64,
            _target: &StreamTarget,
            _route: &EffectiveRoute,
        ) -> umbra::error::Result<()> {
            *self.opens.lock().unwrap() += 1;
            let headers = StreamHeaders {
                content_type: Some("audio/mpeg".into()),
                bitrate_bps: Some(128_000),
                ..StreamHeaders::default()
            };
            (self.notify)(generation, ConnectionEvent::Opened(headers));
            (self.notify)(generation, ConnectionEvent::Ready);
            Ok(())
        }

        fn teardown(&mut self) {}

        fn pause(&mut self) {}

        fn resume(&mut self) {}

        fn set_volume(&mut self, volume: f32) {
            *self.volume.lock().unwrap() = volume;
        }
    }

    /// Serves an endless body of `b'x'` chunks
    struct EndlessConnector;

    struct Endless;

    impl Read for Endless {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            let n = buf.len().min(64);
            buf[..n].fill(b'x');
            Ok(n)
        }
    }

    impl Connector for EndlessConnector {
        fn connect(
            &self,
            _target: &StreamTarget,
            _route: &EffectiveRoute,
            _cancel: &CancellationToken,
        ) -> std::result::Result<Box<dyn Read + Send>, ConnectError> {
            Ok(Box::new(Endless))
        }
    }

    struct Harness {
        service: StreamingService<LoopbackBackend>,
        handle: ServiceHandle,
        events: Receiver<ServiceEvent>,
        arbiter: FocusArbiter,
        opens: Arc<Mutex<u32>>,
        volume: Arc<Mutex<f32>>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let settings = Settings {
                recording_storage: RecordingStorage::Directory,
                recording_directory: Some(dir.path().to_path_buf()),
                ..Settings::default()
            };
            let mut parts = ServiceParts::new(
                Arc::new(Mutex::new(settings)),
                Arc::new(StaticRouting::default()),
            );
            parts.connector = Arc::new(EndlessConnector);
            let arbiter = parts.arbiter.clone();

            let opens = Arc::new(Mutex::new(0));
            let volume = Arc::new(Mutex::new(-1.0));
            let (o, v) = (opens.clone(), volume.clone());
            let (service, handle) = StreamingService::new(parts, move |notify| {
                Ok(LoopbackBackend {
                    notify,
                    opens: o,
                    volume: v,
                })
            })
            .unwrap();
            let events = handle.subscribe();
            Self {
                service,
                handle,
                events,
                arbiter,
                opens,
                volume,
                _dir: dir,
            }
        }

        fn dir(&self) -> &std::path::Path {
            self._dir.path()
        }

        /// Handle `cmd` plus everything it queued, then publish
        fn send(&mut self, cmd: ServiceCommand) {
            self.service.handle_command(cmd);
            self.drain();
        }

        fn drain(&mut self) {
            while let Ok(cmd) = self.service.cmd_rx.try_recv() {
                self.service.handle_command(cmd);
            }
            self.service.publish();
        }

        fn events(&self) -> Vec<ServiceEvent> {
            self.events.try_iter().collect()
        }

        fn wait_recording(&mut self, state: RecordingState) -> bool {
            for _ in 0..250 {
                self.drain();
                if self.service.recorder.state() == state {
                    return true;
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }
    }

    fn target() -> StreamTarget {
        StreamTarget::new("http://radio.example.org/live.mp3", "Example FM")
    }

    // --- Playback ---

    #[test]
    fn play_reaches_playing_and_publishes() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));

        let snap = h.handle.snapshot();
        assert_eq!(snap.playback, PlaybackState::Playing);
        assert_eq!(snap.station_name.as_deref(), Some("Example FM"));
        assert_eq!(snap.bitrate_bps, Some(128_000));
        assert_eq!(snap.codec.as_deref(), Some("MP3"));
        assert!(h.events().contains(&ServiceEvent::PlaybackStateChanged {
            is_buffering: false,
            is_playing: true,
        }));
    }

    #[test]
    fn metadata_reaches_snapshot() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        let generation = h.service.session.generation();
        h.send(ServiceCommand::Connection {
            generation,
            event: ConnectionEvent::Metadata("Artist - Song".into()),
        });
        assert_eq!(h.handle.snapshot().title.as_deref(), Some("Artist - Song"));
    }

    #[test]
    fn pause_and_resume() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::Pause);
        assert_eq!(h.handle.snapshot().playback, PlaybackState::Paused);
        h.send(ServiceCommand::Resume);
        assert_eq!(h.handle.snapshot().playback, PlaybackState::Playing);
    }

    #[test]
    fn volume_goes_to_backend_and_settings() {
        let mut h = Harness::new();
        assert_eq!(*h.volume.lock().unwrap(), 0.8);
        h.send(ServiceCommand::SetVolume(1.7));
        assert_eq!(*h.volume.lock().unwrap(), 1.0);
        assert_eq!(h.service.settings.lock().unwrap().volume, 1.0);
        assert_eq!(h.handle.snapshot().volume, 1.0);
    }

    #[test]
    fn permanent_focus_loss_stops_playback() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));

        let mut other = h.arbiter.client(|_| {});
        other.acquire();
        h.drain();

        assert_eq!(h.handle.snapshot().playback, PlaybackState::Stopped);
        assert!(h
            .events()
            .contains(&ServiceEvent::AudioFocusLost(FocusLoss::Permanent)));
    }

    #[test]
    fn replay_opens_a_new_connection() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::Play(StreamTarget::new("http://other.example/s", "Other")));
        assert_eq!(*h.opens.lock().unwrap(), 2);
        assert_eq!(h.handle.snapshot().station_name.as_deref(), Some("Other"));
    }

    // --- Recording ---

    #[test]
    fn recording_needs_a_stream() {
        let mut h = Harness::new();
        h.send(ServiceCommand::StartRecording {
            station_name: String::new(),
        });
        assert!(h
            .events()
            .contains(&ServiceEvent::RecordingError("No stream is playing".into())));
        assert_eq!(
            h.handle.snapshot().last_error.as_deref(),
            Some("No stream is playing")
        );
    }

    #[test]
    fn record_then_stop_saves_file() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::StartRecording {
            station_name: "Night Show".into(),
        });
        assert!(h.wait_recording(RecordingState::Recording));
        for _ in 0..200 {
            if h.service.recorder.bytes_written() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        h.send(ServiceCommand::StopRecording);
        assert!(h.wait_recording(RecordingState::Completed));
        assert_eq!(h.handle.snapshot().playback, PlaybackState::Playing);

        let files: Vec<_> = std::fs::read_dir(h.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("Night_Show_"), "{files:?}");
        assert!(files[0].ends_with(".mp3"));
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, ServiceEvent::RecordingComplete { .. })));
    }

    #[test]
    fn stop_ends_recording_and_timer() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::StartRecording {
            station_name: String::new(),
        });
        assert!(h.wait_recording(RecordingState::Recording));
        h.send(ServiceCommand::SetSleepTimer { minutes: 30 });
        assert_eq!(h.handle.snapshot().sleep_timer_minutes, 30);

        h.send(ServiceCommand::Stop);
        let snap = h.handle.snapshot();
        assert_eq!(snap.playback, PlaybackState::Stopped);
        assert!(!snap.is_recording());
        assert_eq!(snap.sleep_timer_minutes, 0);
        assert!(snap.station_name.is_none());
    }

    #[test]
    fn switch_without_recording_is_ignored() {
        let mut h = Harness::new();
        h.send(ServiceCommand::SwitchRecordingStream(target()));
        assert_eq!(h.handle.snapshot().recording, RecordingState::Idle);
    }

    // --- Sleep timer ---

    #[test]
    fn sleep_timer_expiry_stops_everything() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::SetSleepTimer { minutes: 1 });
        let remaining = h.handle.snapshot().sleep_timer_remaining_secs;
        assert!((59..=60).contains(&remaining), "{remaining}");

        h.service.tick(Instant::now() + Duration::from_secs(61));
        h.drain();

        assert_eq!(h.handle.snapshot().playback, PlaybackState::Stopped);
        assert!(h.events().contains(&ServiceEvent::SleepTimerExpired));
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut h = Harness::new();
        h.send(ServiceCommand::Play(target()));
        h.send(ServiceCommand::SetSleepTimer { minutes: 1 });
        h.send(ServiceCommand::CancelSleepTimer);

        h.service.tick(Instant::now() + Duration::from_secs(61));
        h.drain();

        assert_eq!(h.handle.snapshot().playback, PlaybackState::Playing);
        assert!(!h.events().contains(&ServiceEvent::SleepTimerExpired));
    }

    // --- Traffic ---

    #[test]
    fn traffic_reaches_snapshot_with_spaced_events() {
        let mut h = Harness::new();
        h.service.traffic.record(2048);
        h.drain();
        assert_eq!(h.handle.snapshot().network_bytes, 2048);
        assert!(h
            .events()
            .contains(&ServiceEvent::TrafficUpdated { total_bytes: 2048 }));

        // The snapshot follows at once; the next event waits its turn
        h.service.traffic.record(1024);
        h.drain();
        assert_eq!(h.handle.snapshot().network_bytes, 3072);
        assert!(!h
            .events()
            .iter()
            .any(|e| matches!(e, ServiceEvent::TrafficUpdated { .. })));
    }

    // --- Thread ---

    #[test]
    fn spawned_service_shuts_down() {
        let h = Harness::new();
        let handle = h.handle.clone();
        let thread = h.service.spawn().unwrap();
        handle.play(target()).unwrap();

        let mut playing = false;
        for _ in 0..100 {
            if handle.snapshot().is_playing() {
                playing = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(playing);

        handle.shutdown().unwrap();
        thread.join().unwrap();
        assert_eq!(handle.snapshot().playback, PlaybackState::Stopped);
    }
}
