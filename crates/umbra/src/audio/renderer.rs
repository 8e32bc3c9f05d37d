//! Audio renderer
//!
//! Runs on a dedicated thread and turns an `IcyStreamReader` into sound (or,
//! headless, into nothing), reporting progress as `ConnectionEvent`s tagged
//! with the connection generation they belong to.
//!
//! `Prepare(generation)` names the only connection allowed to start. A
//! `Start` for any other generation is dropped together with its reader,
//! which closes the late connection.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RadioError, Result};
use crate::playback::{ConnectionEvent, ConnectionNotifier};
use crate::stream::IcyStreamReader;

/// Where rendered audio goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    /// Default audio device (requires the `audio-output` feature)
    Speaker,
    /// Consume the stream without producing sound
    #[default]
    Silent,
}

impl OutputKind {
    /// Speaker when the build supports it, silent otherwise
    pub fn best_available() -> Self {
        if cfg!(feature = "audio-output") {
            OutputKind::Speaker
        } else {
            OutputKind::Silent
        }
    }
}

pub(crate) enum RenderCommand {
    Prepare(u64),
    Start { generation: u64, reader: IcyStreamReader },
    Pause,
    Resume,
    Stop,
    SetVolume(f32),
    Shutdown,
}

/// Cloneable sender side, handed to connect threads
#[derive(Clone)]
pub struct RendererHandle {
    cmd_tx: Sender<RenderCommand>,
}

impl RendererHandle {
    /// Hand a ready stream to the renderer
    pub fn start(&self, generation: u64, reader: IcyStreamReader) {
        let _ = self.cmd_tx.send(RenderCommand::Start { generation, reader });
    }
}

/// Renderer thread owner
pub struct Renderer {
    handle: RendererHandle,
    thread: Option<JoinHandle<()>>,
}

impl Renderer {
    /// Spawn the renderer thread.
    ///
    /// For `Speaker`, blocks until the output device is open (or fails).
    pub fn spawn(output: OutputKind, notify: ConnectionNotifier) -> Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<RenderCommand>();

        let thread = match output {
            OutputKind::Silent => thread::Builder::new()
                .name("audio-renderer".into())
                .spawn(move || SilentOutput::new(notify).run(cmd_rx))?,
            OutputKind::Speaker => spawn_speaker(cmd_rx, notify)?,
        };

        Ok(Self {
            handle: RendererHandle { cmd_tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> RendererHandle {
        self.handle.clone()
    }

    pub fn prepare(&self, generation: u64) {
        self.send(RenderCommand::Prepare(generation));
    }

    pub fn pause(&self) {
        self.send(RenderCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(RenderCommand::Resume);
    }

    pub fn stop(&self) {
        self.send(RenderCommand::Stop);
    }

    pub fn set_volume(&self, volume: f32) {
        self.send(RenderCommand::SetVolume(volume.clamp(0.0, 1.0)));
    }

    fn send(&self, cmd: RenderCommand) {
        let _ = self.handle.cmd_tx.send(cmd);
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.handle.cmd_tx.send(RenderCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// =============================================================================
// Silent output
// =============================================================================

struct Drain {
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    pump_stop: CancellationToken,
}

impl Drain {
    fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.pump_stop.cancel();
    }
}

/// Reads the stream as fast as it arrives and discards it
struct SilentOutput {
    notify: ConnectionNotifier,
    allowed: Option<u64>,
    drain: Option<Drain>,
}

impl SilentOutput {
    fn new(notify: ConnectionNotifier) -> Self {
        Self {
            notify,
            allowed: None,
            drain: None,
        }
    }

    fn run(mut self, cmd_rx: Receiver<RenderCommand>) {
        loop {
            match cmd_rx.recv() {
                Ok(RenderCommand::Prepare(generation)) => {
                    self.cancel();
                    self.allowed = Some(generation);
                }
                Ok(RenderCommand::Start { generation, reader }) => {
                    if self.allowed != Some(generation) {
                        debug!(generation, "Dropping stream for abandoned connection");
                        continue;
                    }
                    self.cancel();
                    self.start(generation, reader);
                }
                Ok(RenderCommand::Pause) => {
                    if let Some(d) = &self.drain {
                        d.paused.store(true, Ordering::SeqCst);
                    }
                }
                Ok(RenderCommand::Resume) => {
                    if let Some(d) = &self.drain {
                        d.paused.store(false, Ordering::SeqCst);
                    }
                }
                Ok(RenderCommand::Stop) => {
                    self.cancel();
                    self.allowed = None;
                }
                Ok(RenderCommand::SetVolume(_)) => {}
                Ok(RenderCommand::Shutdown) | Err(_) => {
                    self.cancel();
                    return;
                }
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(d) = self.drain.take() {
            d.cancel();
        }
    }

    fn start(&mut self, generation: u64, reader: IcyStreamReader) {
        let drain = Drain {
            stop: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            pump_stop: reader.cancel_token(),
        };
        let stop = drain.stop.clone();
        let paused = drain.paused.clone();
        let notify = self.notify.clone();

        let spawned = thread::Builder::new()
            .name("audio-drain".into())
            .spawn(move || drain_stream(generation, reader, stop, paused, notify));
        match spawned {
            Ok(_) => self.drain = Some(drain),
            Err(e) => (self.notify)(
                generation,
                ConnectionEvent::Failed(format!("Failed to start renderer: {e}")),
            ),
        }
    }
}

fn drain_stream(
    generation: u64,
    mut reader: IcyStreamReader,
    stop: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    notify: ConnectionNotifier,
) {
    let mut buf = vec![0u8; 8192];
    let mut ready = false;
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        if paused.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            continue;
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                if !stop.load(Ordering::SeqCst) {
                    notify(generation, ConnectionEvent::Ended);
                }
                return;
            }
            Ok(_) => {
                if !ready {
                    ready = true;
                    notify(generation, ConnectionEvent::Ready);
                }
            }
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    notify(generation, ConnectionEvent::Failed(e.to_string()));
                }
                return;
            }
        }
    }
}

// =============================================================================
// Speaker output
// =============================================================================

#[cfg(not(feature = "audio-output"))]
fn spawn_speaker(_cmd_rx: Receiver<RenderCommand>, _notify: ConnectionNotifier) -> Result<JoinHandle<()>> {
    Err(RadioError::Audio(
        "Built without audio output support (enable the `audio-output` feature)".to_string(),
    ))
}

#[cfg(feature = "audio-output")]
fn spawn_speaker(cmd_rx: Receiver<RenderCommand>, notify: ConnectionNotifier) -> Result<JoinHandle<()>> {
    let (init_tx, init_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
    let thread = thread::Builder::new()
        .name("audio-renderer".into())
        .spawn(move || speaker::run(cmd_rx, notify, init_tx))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(thread),
        Ok(Err(e)) => Err(RadioError::Audio(e)),
        Err(_) => Err(RadioError::Audio("Audio renderer thread exited".to_string())),
    }
}

#[cfg(feature = "audio-output")]
mod speaker {
    use std::time::Instant;

    use crossbeam_channel::RecvTimeoutError;
    use rodio::{Decoder, DeviceSinkBuilder, Player};
    use tracing::{info, warn};

    use super::*;
    use crate::config::playback::PROBE_TIMEOUT_SECS;

    type ProbeResult = std::result::Result<Decoder<IcyStreamReader>, String>;

    struct PendingProbe {
        generation: u64,
        rx: Receiver<ProbeResult>,
        pump_stop: CancellationToken,
        started: Instant,
    }

    pub(super) fn run(
        cmd_rx: Receiver<RenderCommand>,
        notify: ConnectionNotifier,
        init_tx: Sender<std::result::Result<(), String>>,
    ) {
        // cpal streams may be !Send, so the device is opened on this thread
        let mut stream = match DeviceSinkBuilder::open_default_sink() {
            Ok(s) => s,
            Err(e) => {
                let _ = init_tx.send(Err(format!("Failed to open audio output: {e}")));
                return;
            }
        };
        stream.log_on_drop(false);

        // `stream` must be declared before `player` so the player drops first
        let player = Player::connect_new(stream.mixer());
        let _ = init_tx.send(Ok(()));
        info!("Audio output ready");

        let mut allowed: Option<u64> = None;
        let mut playing: Option<u64> = None;
        let mut pending: Option<PendingProbe> = None;
        let mut pump_stop: Option<CancellationToken> = None;

        let cancel = |pending: &mut Option<PendingProbe>,
                      playing: &mut Option<u64>,
                      pump_stop: &mut Option<CancellationToken>| {
            if let Some(p) = pending.take() {
                p.pump_stop.cancel();
            }
            if let Some(token) = pump_stop.take() {
                token.cancel();
            }
            *playing = None;
            player.stop();
        };

        loop {
            let tick = if pending.is_some() || playing.is_some() {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(500)
            };

            match cmd_rx.recv_timeout(tick) {
                Ok(RenderCommand::Prepare(generation)) => {
                    cancel(&mut pending, &mut playing, &mut pump_stop);
                    allowed = Some(generation);
                }
                Ok(RenderCommand::Start { generation, reader }) => {
                    if allowed != Some(generation) {
                        debug!(generation, "Dropping stream for abandoned connection");
                        continue;
                    }
                    cancel(&mut pending, &mut playing, &mut pump_stop);
                    let token = reader.cancel_token();
                    let (tx, rx) = crossbeam_channel::bounded::<ProbeResult>(1);
                    let spawned = thread::Builder::new()
                        .name("audio-probe".into())
                        .spawn(move || {
                            let result = Decoder::new(reader).map_err(|e| e.to_string());
                            let _ = tx.send(result);
                        });
                    match spawned {
                        Ok(_) => {
                            pending = Some(PendingProbe {
                                generation,
                                rx,
                                pump_stop: token,
                                started: Instant::now(),
                            })
                        }
                        Err(e) => notify(
                            generation,
                            ConnectionEvent::Failed(format!("Failed to start probe: {e}")),
                        ),
                    }
                }
                Ok(RenderCommand::Pause) => player.pause(),
                Ok(RenderCommand::Resume) => player.play(),
                Ok(RenderCommand::Stop) => {
                    cancel(&mut pending, &mut playing, &mut pump_stop);
                    allowed = None;
                }
                Ok(RenderCommand::SetVolume(v)) => player.set_volume(v),
                Ok(RenderCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    cancel(&mut pending, &mut playing, &mut pump_stop);
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            // Probe progress
            if let Some(probe) = pending.take() {
                match probe.rx.try_recv() {
                    Ok(Ok(decoder)) => {
                        player.append(decoder);
                        player.play();
                        playing = Some(probe.generation);
                        pump_stop = Some(probe.pump_stop);
                        notify(probe.generation, ConnectionEvent::Ready);
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Format probe failed");
                        probe.pump_stop.cancel();
                        notify(
                            probe.generation,
                            ConnectionEvent::Failed(format!("Decode error: {e}")),
                        );
                    }
                    Err(_) if probe.started.elapsed() >= Duration::from_secs(PROBE_TIMEOUT_SECS) => {
                        probe.pump_stop.cancel();
                        notify(
                            probe.generation,
                            ConnectionEvent::Failed("Timed out detecting stream format".to_string()),
                        );
                    }
                    Err(_) => pending = Some(probe),
                }
            }

            // Source exhausted: the stream ended or its reader failed
            if let Some(generation) = playing {
                if player.empty() {
                    playing = None;
                    pump_stop = None;
                    notify(generation, ConnectionEvent::Ended);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Chunk;
    use crossbeam_channel::bounded;
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(u64, ConnectionEvent)>>>;

    fn recording_notifier() -> (ConnectionNotifier, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notify: ConnectionNotifier = Arc::new(move |generation, event| {
            sink.lock().unwrap().push((generation, event));
        });
        (notify, seen)
    }

    fn wait_for(seen: &Seen, count: usize) -> Vec<(u64, ConnectionEvent)> {
        for _ in 0..100 {
            let events = seen.lock().unwrap().clone();
            if events.len() >= count {
                return events;
            }
            thread::sleep(Duration::from_millis(20));
        }
        seen.lock().unwrap().clone()
    }

    #[test]
    fn silent_output_reports_ready_then_ended() {
        let (notify, seen) = recording_notifier();
        let renderer = Renderer::spawn(OutputKind::Silent, notify).unwrap();
        renderer.prepare(3);

        let (tx, rx) = bounded(8);
        tx.send(Chunk::Data(vec![1, 2, 3])).unwrap();
        tx.send(Chunk::End(crate::stream::StreamEnd::Eof)).unwrap();
        renderer
            .handle()
            .start(3, IcyStreamReader::from_test_channel(rx, Vec::new()));

        let events = wait_for(&seen, 2);
        assert_eq!(
            events,
            vec![(3, ConnectionEvent::Ready), (3, ConnectionEvent::Ended)]
        );
    }

    #[test]
    fn silent_output_reports_read_errors() {
        let (notify, seen) = recording_notifier();
        let renderer = Renderer::spawn(OutputKind::Silent, notify).unwrap();
        renderer.prepare(1);

        let (tx, rx) = bounded(8);
        tx.send(Chunk::End(crate::stream::StreamEnd::Error("reset".into())))
            .unwrap();
        renderer
            .handle()
            .start(1, IcyStreamReader::from_test_channel(rx, Vec::new()));

        let events = wait_for(&seen, 1);
        assert!(matches!(&events[0], (1, ConnectionEvent::Failed(msg)) if msg.contains("reset")));
    }

    #[test]
    fn start_for_unprepared_generation_is_dropped() {
        let (notify, seen) = recording_notifier();
        let renderer = Renderer::spawn(OutputKind::Silent, notify).unwrap();
        renderer.prepare(2);

        let (tx, rx) = bounded(8);
        tx.send(Chunk::Data(vec![1])).unwrap();
        let reader = IcyStreamReader::from_test_channel(rx, Vec::new());
        let pump_stop = reader.cancel_token();
        renderer.handle().start(1, reader);

        thread::sleep(Duration::from_millis(200));
        assert!(seen.lock().unwrap().is_empty());
        // Dropping the reader stopped its pump
        assert!(pump_stop.is_cancelled());
    }

    #[test]
    fn start_after_stop_is_dropped() {
        let (notify, seen) = recording_notifier();
        let renderer = Renderer::spawn(OutputKind::Silent, notify).unwrap();
        renderer.prepare(5);
        renderer.stop();

        let (tx, rx) = bounded(8);
        tx.send(Chunk::Data(vec![1])).unwrap();
        renderer
            .handle()
            .start(5, IcyStreamReader::from_test_channel(rx, Vec::new()));

        thread::sleep(Duration::from_millis(200));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[cfg(not(feature = "audio-output"))]
    #[test]
    fn speaker_requires_feature() {
        let (notify, _seen) = recording_notifier();
        assert!(matches!(
            Renderer::spawn(OutputKind::Speaker, notify),
            Err(RadioError::Audio(_))
        ));
        assert_eq!(OutputKind::best_available(), OutputKind::Silent);
    }
}
