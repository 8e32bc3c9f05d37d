//! Network chunk pump
//!
//! Moves bytes from a blocking reader (an HTTP response body) onto a bounded
//! channel from a dedicated thread, stripping ICY metadata blocks on the way.
//! The consumer never blocks on the socket itself, so it can always be woken
//! for cancellation. The stream end is sent explicitly as the last message.
//!
//! The pump shares its `CancellationToken` with the reader (see
//! `stream::http::HttpBody`), so stopping the pump also wakes a read that is
//! blocked on the network.

use std::io::{self, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::metadata::extract_icy_title;

/// How often a blocked send re-checks for cancellation
const SEND_POLL: Duration = Duration::from_millis(250);

/// How a stream finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Server closed the connection cleanly
    Eof,
    /// Read failed
    Error(String),
}

/// Message on the pump channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    End(StreamEnd),
}

/// Pump parameters
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub chunk_size: usize,
    /// ICY metadata interval in bytes, 0 when the stream has no in-band metadata
    pub metaint: usize,
    pub channel_bound: usize,
}

/// Called with each new (changed) stream title
pub type TitleCallback = Box<dyn FnMut(String) + Send>;

/// Owner side of a running pump. Dropping it stops the pump.
pub struct PumpHandle {
    cancel: CancellationToken,
    bytes_received: Arc<AtomicU64>,
    _thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Ask the pump thread to exit. A reader sharing the token wakes at once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The token that stops this pump, for stopping it from another thread
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Audio bytes delivered so far (metadata excluded)
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
            bytes_received: Arc::new(AtomicU64::new(0)),
            _thread: None,
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start pumping `reader` on a thread named `name`. Cancelling `cancel`
/// stops it.
pub fn spawn_pump<R>(
    name: &str,
    reader: R,
    options: PumpOptions,
    on_title: Option<TitleCallback>,
    cancel: CancellationToken,
) -> io::Result<(Receiver<Chunk>, PumpHandle)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded::<Chunk>(options.channel_bound.max(1));
    let bytes_received = Arc::new(AtomicU64::new(0));

    let mut pump = Pump {
        reader,
        tx,
        cancel: cancel.clone(),
        bytes_received: bytes_received.clone(),
        buffer: vec![0u8; options.chunk_size.max(1)],
        metaint: options.metaint,
        bytes_until_meta: options.metaint,
        last_title: String::new(),
        on_title,
    };

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || pump.run())?;

    Ok((
        rx,
        PumpHandle {
            cancel,
            bytes_received,
            _thread: Some(handle),
        },
    ))
}

enum Step {
    Continue,
    Finished(StreamEnd),
    Stopped,
}

struct Pump<R> {
    reader: R,
    tx: Sender<Chunk>,
    cancel: CancellationToken,
    bytes_received: Arc<AtomicU64>,
    buffer: Vec<u8>,
    metaint: usize,
    bytes_until_meta: usize,
    last_title: String,
    on_title: Option<TitleCallback>,
}

impl<R: Read> Pump<R> {
    fn run(&mut self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let step = if self.metaint == 0 {
                self.read_plain()
            } else {
                self.read_with_meta()
            };
            match step {
                Step::Continue => {}
                Step::Stopped => return,
                Step::Finished(end) => {
                    trace!(?end, "Pump finished");
                    if !self.cancel.is_cancelled() {
                        let _ = self.deliver(Chunk::End(end));
                    }
                    return;
                }
            }
        }
    }

    /// Blocking send that still honors cancellation. False when stopped or
    /// the consumer is gone.
    fn deliver(&self, mut chunk: Chunk) -> bool {
        loop {
            match self.tx.send_timeout(chunk, SEND_POLL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Disconnected(_)) => return false,
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() {
                        return false;
                    }
                    chunk = back;
                }
            }
        }
    }

    fn forward(&mut self, n: usize) -> Step {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        if self.deliver(Chunk::Data(self.buffer[..n].to_vec())) {
            Step::Continue
        } else {
            Step::Stopped
        }
    }

    fn read_plain(&mut self) -> Step {
        match self.reader.read(&mut self.buffer) {
            Ok(0) => Step::Finished(StreamEnd::Eof),
            Ok(n) => self.forward(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Step::Continue,
            Err(e) => Step::Finished(StreamEnd::Error(e.to_string())),
        }
    }

    fn read_with_meta(&mut self) -> Step {
        if self.bytes_until_meta > 0 {
            let to_read = self.buffer.len().min(self.bytes_until_meta);
            match self.reader.read(&mut self.buffer[..to_read]) {
                Ok(0) => return Step::Finished(StreamEnd::Eof),
                Ok(n) => {
                    self.bytes_until_meta -= n;
                    if let Step::Stopped = self.forward(n) {
                        return Step::Stopped;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Continue,
                Err(e) => return Step::Finished(StreamEnd::Error(e.to_string())),
            }
        }

        if self.bytes_until_meta == 0 {
            if let Err(e) = self.read_meta_block() {
                return Step::Finished(match e.kind() {
                    io::ErrorKind::UnexpectedEof => StreamEnd::Eof,
                    _ => StreamEnd::Error(e.to_string()),
                });
            }
            self.bytes_until_meta = self.metaint;
        }

        Step::Continue
    }

    fn read_meta_block(&mut self) -> io::Result<()> {
        let mut len_byte = [0u8; 1];
        self.reader.read_exact(&mut len_byte)?;

        let meta_len = len_byte[0] as usize * 16;
        if meta_len == 0 {
            return Ok(());
        }

        let mut meta_buf = vec![0u8; meta_len];
        self.reader.read_exact(&mut meta_buf)?;

        if let Some(title) = extract_icy_title(&meta_buf) {
            if title != self.last_title {
                self.last_title = title.clone();
                if let Some(cb) = self.on_title.as_mut() {
                    cb(title);
                }
            }
        }
        Ok(())
    }
}
