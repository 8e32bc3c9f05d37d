//! Recording pipeline
//!
//! Captures a stream to storage on its own worker thread, with its own route
//! resolution and its own HTTP client, so nothing that happens here can stall
//! playback. The source can be switched mid-recording; the new stream is
//! appended to the same sink.
//!
//! Stop protocol: the active flag is cleared first, then the worker's
//! cancellation token fires and the worker is woken through its cancel
//! channel. The token closes any connection the worker holds, pending or
//! open. The caller waits a bounded time for the worker to finalize, raises
//! the interrupt flag if it has not, waits a little more and finally detaches
//! it.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::recording::{
    CHUNK_CHANNEL_BOUND, CHUNK_SIZE, CONNECT_RETRY_STEP_MS, FLUSH_THRESHOLD,
    INTERRUPT_JOIN_TIMEOUT_SECS, MAX_CONNECT_ATTEMPTS, PROGRESS_LOG_INTERVAL_SECS,
    STOP_JOIN_TIMEOUT_SECS,
};
use crate::error::{RadioError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::routing::{resolve, EffectiveRoute, RoutingContext, StreamTarget};
use crate::stream::{spawn_pump, Chunk, PumpHandle, PumpOptions, StreamEnd};

use super::connector::{ConnectError, Connector};
use super::naming::{recording_file_name, StreamFormat};
use super::sink::{RecordingSink, StorageBackend};
use super::state::RecordingState;

/// State visible from both the pipeline and its worker
struct Shared {
    state: Mutex<RecordingState>,
    connect_attempts: AtomicU32,
    bytes_written: AtomicU64,
    location: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(RecordingState::Idle),
            connect_attempts: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            location: Mutex::new(None),
        }
    }

    fn state(&self) -> RecordingState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a transition if it is legal. Returns false otherwise.
    fn transition(&self, next: RecordingState, events: &EventBus) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next {
            return true;
        }
        if !state.can_transition_to(next) {
            debug!(from = %*state, to = %next, "Ignoring recording transition");
            return false;
        }
        debug!(from = %*state, to = %next, "Recording state");
        *state = next;
        drop(state);
        events.emit(ServiceEvent::RecordingStateChanged(next));
        true
    }
}

struct WorkerHandle {
    id: u64,
    active: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    cancel: CancellationToken,
    cancel_tx: Sender<()>,
    switch_tx: Sender<StreamTarget>,
    done_rx: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Zero-or-one recording at a time
pub struct RecordingPipeline {
    routing: Arc<dyn RoutingContext>,
    connector: Arc<dyn Connector>,
    events: Arc<EventBus>,
    shared: Arc<Shared>,
    retry_step: Duration,
    stop_timeout: Duration,
    worker: Option<WorkerHandle>,
    next_id: u64,
}

impl RecordingPipeline {
    pub fn new(
        routing: Arc<dyn RoutingContext>,
        connector: Arc<dyn Connector>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            routing,
            connector,
            events,
            shared: Arc::new(Shared::new()),
            retry_step: Duration::from_millis(CONNECT_RETRY_STEP_MS),
            stop_timeout: Duration::from_secs(STOP_JOIN_TIMEOUT_SECS),
            worker: None,
            next_id: 0,
        }
    }

    /// Use a different connect retry step (the n-th retry waits `n * step`)
    pub fn with_retry_step(mut self, step: Duration) -> Self {
        self.retry_step = step;
        self
    }

    /// Use a different grace period for the worker on stop
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn state(&self) -> RecordingState {
        self.shared.state()
    }

    /// True while a worker is connecting, recording or switching
    pub fn is_recording(&self) -> bool {
        self.worker.is_some()
            && matches!(
                self.state(),
                RecordingState::Connecting | RecordingState::Recording | RecordingState::Switching
            )
    }

    /// Connect attempts used by the most recent connect phase
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Bytes written to the current (or last) sink
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::SeqCst)
    }

    /// Location of the current (or last) recording, once its sink is open
    pub fn location(&self) -> Option<String> {
        self.shared
            .location
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start recording `target` into a sink opened from `storage`.
    ///
    /// The connection is made on the worker; failures are reported as
    /// `RecordingError` events, not through the return value.
    pub fn start(&mut self, target: StreamTarget, storage: Arc<dyn StorageBackend>) -> Result<()> {
        self.reap();
        if self.worker.is_some() {
            warn!("Recording already in progress");
            return Err(RadioError::RecordingInProgress);
        }

        self.next_id += 1;
        let id = self.next_id;
        // Fresh per recording, so a detached worker can never touch the new one
        self.shared = Arc::new(Shared::new());
        self.shared.transition(RecordingState::Connecting, &self.events);

        let active = Arc::new(AtomicBool::new(true));
        let interrupt = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (switch_tx, switch_rx) = unbounded::<StreamTarget>();
        let (done_tx, done_rx) = bounded::<()>(1);

        let worker = Worker {
            id,
            routing: self.routing.clone(),
            connector: self.connector.clone(),
            storage,
            events: self.events.clone(),
            shared: self.shared.clone(),
            active: active.clone(),
            interrupt: interrupt.clone(),
            cancel: cancel.clone(),
            cancel_rx,
            switch_rx,
            retry_step: self.retry_step,
            _done: done_tx,
        };

        info!(id, url = %target.url, station = %target.station_name, "Starting recording");
        let spawned = thread::Builder::new()
            .name(format!("recording-{id}"))
            .spawn(move || worker.run(target));
        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                self.shared.transition(RecordingState::Failed, &self.events);
                return Err(e.into());
            }
        };

        self.worker = Some(WorkerHandle {
            id,
            active,
            interrupt,
            cancel,
            cancel_tx,
            switch_tx,
            done_rx,
            thread,
        });
        Ok(())
    }

    /// Redirect the running recording to `target`, keeping the same sink.
    /// Returns false (and does nothing) when no recording is running.
    pub fn switch_stream(&mut self, target: StreamTarget) -> bool {
        self.reap();
        if !self.is_recording() {
            debug!("Switch requested while not recording");
            return false;
        }
        let Some(worker) = &self.worker else {
            return false;
        };
        info!(id = worker.id, url = %target.url, "Switching recording stream");
        worker.switch_tx.send(target).is_ok()
    }

    /// Stop the recording and wait for it to be finalized.
    /// Returns false when nothing was recording.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            return false;
        };

        worker.active.store(false, Ordering::SeqCst);
        self.shared.transition(RecordingState::Stopping, &self.events);
        worker.cancel.cancel();
        let _ = worker.cancel_tx.try_send(());

        if !wait_done(&worker.done_rx, self.stop_timeout) {
            warn!(id = worker.id, "Recording worker slow to stop, interrupting");
            worker.interrupt.store(true, Ordering::SeqCst);
            if !wait_done(
                &worker.done_rx,
                Duration::from_secs(INTERRUPT_JOIN_TIMEOUT_SECS),
            ) {
                warn!(id = worker.id, "Recording worker did not stop, detaching");
                return true;
            }
        }
        let _ = worker.thread.join();
        info!(id = worker.id, "Recording stopped");
        true
    }

    /// Join a worker that finished on its own (stream ended or failed)
    pub fn reap(&mut self) {
        let finished = self
            .worker
            .as_ref()
            .is_some_and(|w| w.thread.is_finished());
        if finished {
            if let Some(worker) = self.worker.take() {
                let _ = worker.thread.join();
                debug!(id = worker.id, "Recording worker reaped");
            }
        }
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True once the worker has dropped its end of `done`
fn wait_done(done_rx: &Receiver<()>, timeout: Duration) -> bool {
    matches!(
        done_rx.recv_timeout(timeout),
        Ok(()) | Err(RecvTimeoutError::Disconnected)
    )
}

// =============================================================================
// Worker
// =============================================================================

/// An open stream and the token that closes it
struct Connection {
    body: Box<dyn Read + Send>,
    cancel: CancellationToken,
}

enum ConnectOutcome {
    Connected(Connection),
    Cancelled,
    Failed(String),
}

enum LoopEnd {
    /// Source ended with no switch pending
    Ended,
    Stopped,
    ReadError(String),
    WriteError(String),
    SwitchFailed(String),
}

enum Next {
    Stop,
    Switch(StreamTarget),
    Chunk(Option<Chunk>),
}

/// A connected source: the pump channel plus the handle keeping the pump
/// alive. Stopping the pump closes the connection.
struct Source {
    rx: Receiver<Chunk>,
    pump: PumpHandle,
}

struct Progress {
    since_flush: usize,
    last_log: Instant,
}

struct Worker {
    id: u64,
    routing: Arc<dyn RoutingContext>,
    connector: Arc<dyn Connector>,
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    shared: Arc<Shared>,
    active: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
    /// Parent of every connection token; cancelled on stop
    cancel: CancellationToken,
    cancel_rx: Receiver<()>,
    switch_rx: Receiver<StreamTarget>,
    retry_step: Duration,
    /// Dropped when the worker exits, which is what `stop` waits for
    _done: Sender<()>,
}

impl Worker {
    fn stopping(&self) -> bool {
        !self.active.load(Ordering::SeqCst) || self.interrupt.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: RecordingState) {
        self.shared.transition(state, &self.events);
    }

    fn report_error(&self, message: String) {
        warn!(id = self.id, %message, "Recording error");
        self.events.emit(ServiceEvent::RecordingError(message));
    }

    fn run(self, target: StreamTarget) {
        let format = StreamFormat::from_url(&target.url);
        let file_name = recording_file_name(&target.station_name, format, Local::now());

        let connection = match self.connect(&target) {
            ConnectOutcome::Connected(connection) => connection,
            ConnectOutcome::Cancelled => {
                debug!(id = self.id, "Recording cancelled while connecting");
                self.set_state(RecordingState::Completed);
                return;
            }
            ConnectOutcome::Failed(msg) => {
                self.report_error(msg);
                self.set_state(RecordingState::Failed);
                return;
            }
        };

        let mut sink = match self.storage.open(&file_name, format.mime_type()) {
            Ok(sink) => sink,
            Err(e) => {
                self.report_error(e.to_string());
                self.set_state(RecordingState::Failed);
                return;
            }
        };
        let location = sink.location();
        info!(id = self.id, backend = self.storage.name(), %location, "Recording to");
        *self.shared.location.lock().unwrap_or_else(|e| e.into_inner()) = Some(location.clone());
        self.events.emit(ServiceEvent::RecordingStarted { location });

        let end = match self.open_source(connection) {
            Ok(source) => {
                self.set_state(RecordingState::Recording);
                self.write_loop(source, sink.as_mut())
            }
            Err(msg) => LoopEnd::ReadError(msg),
        };
        self.finish(sink, end);
    }

    /// Resolve a route for `target` and connect, retrying transient failures
    fn connect(&self, target: &StreamTarget) -> ConnectOutcome {
        let route = resolve(target, &self.routing.policy(), &self.routing.tor());
        if let EffectiveRoute::Blocked(reason) = &route {
            warn!(id = self.id, %reason, "Recording route blocked");
            return ConnectOutcome::Failed(reason.to_string());
        }

        let mut attempt = 0;
        loop {
            if self.stopping() {
                return ConnectOutcome::Cancelled;
            }
            attempt += 1;
            self.shared.connect_attempts.store(attempt, Ordering::SeqCst);

            let err = match self.connect_once(target, &route) {
                Ok(Some(connection)) => {
                    info!(id = self.id, attempt, %route, "Recording connected");
                    return ConnectOutcome::Connected(connection);
                }
                Ok(None) | Err(ConnectError::Cancelled) => return ConnectOutcome::Cancelled,
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= MAX_CONNECT_ATTEMPTS {
                return ConnectOutcome::Failed(err.message().to_string());
            }

            let delay = self.retry_step * attempt;
            warn!(
                id = self.id,
                attempt,
                max = MAX_CONNECT_ATTEMPTS,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Recording connect failed, retrying"
            );
            match self.cancel_rx.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return ConnectOutcome::Cancelled,
            }
        }
    }

    /// One connect attempt on a helper thread, abandoned if a stop arrives.
    /// `Ok(None)` means cancelled. The connection gets its own child token
    /// so a switch can close it without stopping the worker.
    fn connect_once(
        &self,
        target: &StreamTarget,
        route: &EffectiveRoute,
    ) -> std::result::Result<Option<Connection>, ConnectError> {
        let cancel = self.cancel.child_token();
        let (tx, rx) = bounded(1);
        let connector = self.connector.clone();
        let target = target.clone();
        let route = route.clone();
        let token = cancel.clone();
        thread::Builder::new()
            .name(format!("recording-connect-{}", self.id))
            .spawn(move || {
                let _ = tx.send(connector.connect(&target, &route, &token));
            })
            .map_err(|e| ConnectError::Hard(format!("Failed to start connect thread: {e}")))?;

        select! {
            recv(self.cancel_rx) -> _ => {
                cancel.cancel();
                Ok(None)
            }
            recv(rx) -> result => match result {
                Ok(Ok(body)) => Ok(Some(Connection { body, cancel })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ConnectError::Hard("Connect thread exited".to_string())),
            },
        }
    }

    fn open_source(&self, connection: Connection) -> std::result::Result<Source, String> {
        let options = PumpOptions {
            chunk_size: CHUNK_SIZE,
            metaint: 0,
            channel_bound: CHUNK_CHANNEL_BOUND,
        };
        let name = format!("recording-pump-{}", self.id);
        spawn_pump(&name, connection.body, options, None, connection.cancel)
            .map(|(rx, pump)| Source { rx, pump })
            .map_err(|e| format!("Failed to start recording reader: {e}"))
    }

    fn write_loop(&self, mut source: Source, sink: &mut dyn RecordingSink) -> LoopEnd {
        let mut progress = Progress {
            since_flush: 0,
            last_log: Instant::now(),
        };

        loop {
            if self.stopping() {
                return LoopEnd::Stopped;
            }

            let next = select! {
                recv(self.cancel_rx) -> _ => Next::Stop,
                recv(self.switch_rx) -> msg => match msg {
                    Ok(target) => Next::Switch(target),
                    Err(_) => Next::Stop,
                },
                recv(source.rx) -> msg => Next::Chunk(msg.ok()),
            };

            let target = match next {
                Next::Stop => return LoopEnd::Stopped,
                Next::Chunk(Some(Chunk::Data(bytes))) => {
                    if let Err(e) = self.write(sink, &bytes, &mut progress) {
                        return LoopEnd::WriteError(e.to_string());
                    }
                    continue;
                }
                Next::Chunk(end) => {
                    // Stream over. Switch now if a switch is pending.
                    match self.switch_rx.try_recv() {
                        Ok(target) => target,
                        Err(_) => {
                            return match end {
                                Some(Chunk::End(StreamEnd::Error(msg))) => LoopEnd::ReadError(msg),
                                _ => {
                                    info!(id = self.id, "Recording source ended");
                                    LoopEnd::Ended
                                }
                            };
                        }
                    }
                }
                Next::Switch(target) => {
                    if let Err(e) = self.drain(&source, sink, &mut progress) {
                        return LoopEnd::WriteError(e.to_string());
                    }
                    target
                }
            };

            // The old connection closes before the new one opens
            source.pump.stop();
            // Later requests supersede earlier ones
            let target = self.switch_rx.try_iter().last().unwrap_or(target);
            match self.switch_to(&target, sink) {
                Ok(next_source) => source = next_source,
                Err(end) => return end,
            }
        }
    }

    /// Write what the old connection already delivered
    fn drain(&self, source: &Source, sink: &mut dyn RecordingSink, progress: &mut Progress) -> Result<()> {
        for chunk in source.rx.try_iter() {
            if self.interrupt.load(Ordering::SeqCst) {
                break;
            }
            match chunk {
                Chunk::Data(bytes) => self.write(sink, &bytes, progress)?,
                Chunk::End(_) => break,
            }
        }
        Ok(())
    }

    fn switch_to(&self, target: &StreamTarget, sink: &mut dyn RecordingSink) -> std::result::Result<Source, LoopEnd> {
        self.set_state(RecordingState::Switching);
        if let Err(e) = sink.flush() {
            return Err(LoopEnd::WriteError(e.to_string()));
        }

        match self.connect(target) {
            ConnectOutcome::Connected(connection) => {
                let source = self.open_source(connection).map_err(LoopEnd::ReadError)?;
                info!(id = self.id, url = %target.url, "Recording switched");
                self.set_state(RecordingState::Recording);
                Ok(source)
            }
            ConnectOutcome::Cancelled => Err(LoopEnd::Stopped),
            ConnectOutcome::Failed(msg) => Err(LoopEnd::SwitchFailed(msg)),
        }
    }

    fn write(&self, sink: &mut dyn RecordingSink, bytes: &[u8], progress: &mut Progress) -> Result<()> {
        sink.write(bytes)?;
        let total = self.shared.bytes_written.fetch_add(bytes.len() as u64, Ordering::SeqCst)
            + bytes.len() as u64;

        progress.since_flush += bytes.len();
        if progress.since_flush >= FLUSH_THRESHOLD {
            sink.flush()?;
            progress.since_flush = 0;
        }

        if progress.last_log.elapsed() >= Duration::from_secs(PROGRESS_LOG_INTERVAL_SECS) {
            info!(id = self.id, kib = total / 1024, "Recording progress");
            progress.last_log = Instant::now();
        }
        Ok(())
    }

    fn finish(&self, sink: Box<dyn RecordingSink>, end: LoopEnd) {
        let state = match end {
            LoopEnd::Ended | LoopEnd::Stopped => {
                if self.finalize(sink) {
                    RecordingState::Completed
                } else {
                    RecordingState::Failed
                }
            }
            LoopEnd::ReadError(msg) => {
                self.report_error(format!("Stream read failed: {msg}"));
                self.finalize(sink);
                RecordingState::Failed
            }
            LoopEnd::SwitchFailed(msg) => {
                self.report_error(format!("Could not switch recording stream: {msg}"));
                self.finalize(sink);
                RecordingState::Failed
            }
            LoopEnd::WriteError(msg) => {
                self.report_error(msg);
                if let Err(e) = sink.discard() {
                    warn!(id = self.id, error = %e, "Failed to discard recording");
                }
                RecordingState::Failed
            }
        };
        self.set_state(state);
    }

    /// Consume the sink. Empty recordings are discarded. Returns false if
    /// saving failed.
    fn finalize(&self, sink: Box<dyn RecordingSink>) -> bool {
        if sink.bytes_written() == 0 {
            info!(id = self.id, "Recording is empty, discarding");
            if let Err(e) = sink.discard() {
                warn!(id = self.id, error = %e, "Failed to discard empty recording");
            }
            return true;
        }

        match sink.finalize() {
            Ok(saved) => {
                info!(id = self.id, location = %saved.location, size_bytes = saved.size_bytes, "Recording complete");
                self.events.emit(ServiceEvent::RecordingComplete {
                    path: saved.path,
                    size_bytes: saved.size_bytes,
                });
                true
            }
            Err(e) => {
                self.report_error(format!("Failed to save recording: {e}"));
                false
            }
        }
    }
}
