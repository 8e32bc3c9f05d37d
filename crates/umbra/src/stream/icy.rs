//! ICY stream reader
//!
//! Wraps the pump channel of an Icecast/Shoutcast response in a Read+Seek
//! interface for the audio renderer, and parses the response headers that
//! describe the stream.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use super::metadata::{codec_from_content_type, parse_icy_bitrate};
use super::pump::{Chunk, PumpHandle, StreamEnd};

/// How long a read waits before re-checking whether the pump was stopped
const READ_POLL: Duration = Duration::from_millis(500);

/// Headers parsed from a stream response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeaders {
    pub metaint: usize,
    pub station_name: Option<String>,
    pub content_type: Option<String>,
    /// Bits per second, from `icy-br`
    pub bitrate_bps: Option<u32>,
}

impl StreamHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        Self {
            metaint: text("icy-metaint")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0),
            station_name: text("icy-name"),
            content_type: text("content-type"),
            bitrate_bps: text("icy-br").and_then(|v| parse_icy_bitrate(&v)),
        }
    }

    /// Codec name derived from the content type
    pub fn codec(&self) -> Option<&'static str> {
        self.content_type.as_deref().and_then(codec_from_content_type)
    }
}

/// Audio bytes of one connection, served from the pump channel.
///
/// Holds at most one chunk at a time. Seeking is only possible within that
/// chunk, which is all the format probe needs.
pub struct IcyStreamReader {
    current_chunk: Vec<u8>,
    chunk_pos: usize,
    receiver: Receiver<Chunk>,
    finished: bool,
    pump: PumpHandle,
}

impl IcyStreamReader {
    pub fn new(receiver: Receiver<Chunk>, pump: PumpHandle) -> Self {
        Self {
            current_chunk: Vec::new(),
            chunk_pos: 0,
            receiver,
            finished: false,
            pump,
        }
    }

    /// Audio bytes received from the network so far
    pub fn bytes_received(&self) -> u64 {
        self.pump.bytes_received()
    }

    /// Token that stops the underlying pump and its connection
    pub fn cancel_token(&self) -> CancellationToken {
        self.pump.cancel_token()
    }

    /// Create a reader from a test channel (bypasses HTTP)
    #[cfg(test)]
    pub(crate) fn from_test_channel(receiver: Receiver<Chunk>, initial_data: Vec<u8>) -> Self {
        Self {
            current_chunk: initial_data,
            chunk_pos: 0,
            receiver,
            finished: false,
            pump: PumpHandle::detached(),
        }
    }

    fn take_chunk(&mut self, chunk: Chunk) -> io::Result<bool> {
        match chunk {
            Chunk::Data(data) => {
                self.current_chunk = data;
                self.chunk_pos = 0;
                Ok(true)
            }
            Chunk::End(StreamEnd::Eof) => {
                self.finished = true;
                Ok(false)
            }
            Chunk::End(StreamEnd::Error(msg)) => {
                self.finished = true;
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, msg))
            }
        }
    }
}

impl Read for IcyStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let remaining = self.current_chunk.len() - self.chunk_pos;
            if remaining > 0 {
                let n = buf.len().min(remaining);
                buf[..n].copy_from_slice(&self.current_chunk[self.chunk_pos..self.chunk_pos + n]);
                self.chunk_pos += n;
                if self.chunk_pos >= self.current_chunk.len() {
                    self.current_chunk = Vec::new();
                    self.chunk_pos = 0;
                }
                return Ok(n);
            }

            if self.finished {
                return Ok(0);
            }

            match self.receiver.try_recv() {
                Ok(chunk) => {
                    if !self.take_chunk(chunk)? {
                        return Ok(0);
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"));
                }
            }

            match self.receiver.recv_timeout(READ_POLL) {
                Ok(chunk) => {
                    if !self.take_chunk(chunk)? {
                        return Ok(0);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.pump.is_stopped() {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream stopped"));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"));
                }
            }
        }
    }
}

impl Seek for IcyStreamReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.current_chunk.len();
        let new_pos = match pos {
            SeekFrom::Start(p) => usize::try_from(p).unwrap_or(usize::MAX),
            SeekFrom::Current(p) if p >= 0 => self.chunk_pos.saturating_add(p as usize),
            SeekFrom::Current(p) => self.chunk_pos.saturating_sub(p.unsigned_abs() as usize),
            SeekFrom::End(p) if p >= 0 => len,
            SeekFrom::End(p) => len.saturating_sub(p.unsigned_abs() as usize),
        };
        self.chunk_pos = new_pos.min(len);
        Ok(self.chunk_pos as u64)
    }
}

impl Drop for IcyStreamReader {
    fn drop(&mut self) {
        self.pump.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    // --- StreamHeaders ---

    #[test]
    fn headers_parse_all_fields() {
        let h = StreamHeaders::from_headers(&headers(&[
            ("icy-metaint", "16000"),
            ("icy-name", "Classic FM"),
            ("content-type", "audio/mpeg"),
            ("icy-br", "128"),
        ]));
        assert_eq!(h.metaint, 16000);
        assert_eq!(h.station_name.as_deref(), Some("Classic FM"));
        assert_eq!(h.bitrate_bps, Some(128_000));
        assert_eq!(h.codec(), Some("MP3"));
    }

    #[test]
    fn headers_missing_fields() {
        let h = StreamHeaders::from_headers(&HeaderMap::new());
        assert_eq!(h, StreamHeaders::default());
        assert_eq!(h.codec(), None);
    }

    #[test]
    fn headers_invalid_metaint_is_zero() {
        let h = StreamHeaders::from_headers(&headers(&[("icy-metaint", "lots")]));
        assert_eq!(h.metaint, 0);
    }

    #[test]
    fn headers_blank_name_ignored() {
        let h = StreamHeaders::from_headers(&headers(&[("icy-name", "  ")]));
        assert!(h.station_name.is_none());
    }

    // --- Reading ---

    #[test]
    fn read_from_channel() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1, 2, 3, 4]);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [1, 2, 3, 4]);

        tx.send(Chunk::Data(vec![5, 6])).unwrap();
        let mut buf2 = [0u8; 2];
        assert_eq!(reader.read(&mut buf2).unwrap(), 2);
        assert_eq!(buf2, [5, 6]);
    }

    #[test]
    fn read_partial() {
        let (_tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![10, 20, 30, 40, 50]);

        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [10, 20]);

        let mut buf2 = [0u8; 10];
        assert_eq!(reader.read(&mut buf2).unwrap(), 3);
        assert_eq!(&buf2[..3], &[30, 40, 50]);
    }

    #[test]
    fn chunks_served_one_at_a_time() {
        let (tx, rx) = bounded(16);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![]);
        for i in 0u8..5 {
            tx.send(Chunk::Data(vec![i])).unwrap();
        }
        let mut buf = [0u8; 10];
        for i in 0u8..5 {
            assert_eq!(reader.read(&mut buf).unwrap(), 1);
            assert_eq!(buf[0], i);
        }
    }

    #[test]
    fn eof_marker_reads_zero() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1]);
        tx.send(Chunk::End(StreamEnd::Eof)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        // Stays at EOF
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn error_marker_surfaces_as_io_error() {
        let (tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![]);
        tx.send(Chunk::End(StreamEnd::Error("connection reset".into())))
            .unwrap();
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(err.to_string().contains("reset"));
    }

    #[test]
    fn disconnected_channel_is_unexpected_eof() {
        let (tx, rx) = bounded::<Chunk>(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![]);
        drop(tx);
        let err = reader.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn read_zero_length_buffer() {
        let (_tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1, 2, 3]);
        assert_eq!(reader.read(&mut []).unwrap(), 0);
    }

    // --- Seeking ---

    #[test]
    fn seek_within_current_chunk() {
        let (_tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        reader.read(&mut buf).unwrap();
        assert_eq!(reader.seek(SeekFrom::Start(0)).unwrap(), 0);

        let mut buf2 = [0u8; 5];
        assert_eq!(reader.read(&mut buf2).unwrap(), 5);
        assert_eq!(buf2, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn seek_relative_and_from_end() {
        let (_tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1, 2, 3, 4, 5]);
        assert_eq!(reader.seek(SeekFrom::Current(3)).unwrap(), 3);
        assert_eq!(reader.seek(SeekFrom::Current(-1)).unwrap(), 2);
        assert_eq!(reader.seek(SeekFrom::End(-1)).unwrap(), 4);
        assert_eq!(reader.seek(SeekFrom::End(10)).unwrap(), 5);
        assert_eq!(reader.seek(SeekFrom::Current(-100)).unwrap(), 0);
    }

    #[test]
    fn seek_clamps_to_chunk_length() {
        let (_tx, rx) = bounded(8);
        let mut reader = IcyStreamReader::from_test_channel(rx, vec![1, 2, 3]);
        assert_eq!(reader.seek(SeekFrom::Start(100)).unwrap(), 3);
    }
}
