// One side of a relay connection: a stream plus its framing state.
//
// `Endpoint` wraps any `Read + Write` stream (a blocking `std::net::TcpStream`
// on simple peers, a non-blocking socket on the client and the relay, or an
// in-memory mock in tests) and layers the protocol on top:
//
// - raw: `send_raw` / `recv_raw`, unframed bytes.
// - framed: `send_framed` / `recv_framed`, one length-prefixed payload.
// - events: `send_event` / `recv_event`, one encoded `Event` per frame.
//
// Reads go through a per-connection `FrameDecoder`, so `recv_framed` behaves
// the same whether the stream blocks or not: bytes read past the end of the
// current frame are kept for the next call, and a would-block in the middle
// of a frame leaves the partial frame buffered instead of losing it.
//
// Writes on a non-blocking stream can hit a full socket buffer. `send_raw`
// retries until the frame is fully written or `Config::send_timeout`
// elapses. A timed-out frame may be partially written, after which the
// stream is no longer in sync and the connection should be dropped.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use event_relay_protocol::{Event, FrameDecoder, encode_frame};
use tracing::debug;

use crate::config::Config;
use crate::error::RelayError;

/// Bytes requested from the stream per read while assembling a frame.
const READ_CHUNK: usize = 8192;

/// Pause between retries of a write that would block.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(1);

pub struct Endpoint<S> {
    stream: S,
    decoder: FrameDecoder,
    raw_recv_size: usize,
    send_timeout: Duration,
}

impl<S: Read + Write> Endpoint<S> {
    pub fn new(stream: S, config: &Config) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(config.max_frame_size),
            raw_recv_size: config.raw_recv_size,
            send_timeout: config.send_timeout,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes received but not yet returned by any `recv_*` call.
    pub fn buffered_len(&self) -> usize {
        self.decoder.buffered_len()
    }

    /// Write all of `bytes`.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        let deadline = Instant::now() + self.send_timeout;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(0) => {
                    return Err(RelayError::Transport(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )));
                }
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(RelayError::SendTimeout);
                    }
                    thread::sleep(SEND_RETRY_INTERVAL);
                }
                Err(e) => return Err(RelayError::Transport(e)),
            }
        }
        self.stream.flush().map_err(RelayError::Transport)
    }

    /// Read up to `max_bytes` unframed bytes. Bytes already buffered by an
    /// earlier framed read are returned first, so raw and framed reads never
    /// reorder the stream.
    ///
    /// An empty result means the peer closed the stream.
    pub fn recv_raw(&mut self, max_bytes: usize) -> Result<Vec<u8>, RelayError> {
        if self.decoder.has_partial() {
            return Ok(self.decoder.take_buffered(max_bytes));
        }
        let mut buf = vec![0u8; max_bytes];
        loop {
            match self.stream.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `recv_raw` with the configured default read size.
    pub fn recv_raw_default(&mut self) -> Result<Vec<u8>, RelayError> {
        self.recv_raw(self.raw_recv_size)
    }

    /// Write `payload` as one frame.
    pub fn send_framed(&mut self, payload: &[u8]) -> Result<(), RelayError> {
        let frame = encode_frame(payload, self.decoder.max_frame_size())?;
        self.send_raw(&frame)
    }

    /// Read one complete frame payload.
    ///
    /// Fails with `Closed` if the stream ends first (`mid_frame` tells whether
    /// part of a frame had arrived), `Framing` if the header is invalid or over
    /// the size cap, and `WouldBlock` if a non-blocking stream runs dry before
    /// the frame is complete.
    pub fn recv_framed(&mut self) -> Result<Vec<u8>, RelayError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(payload);
            }
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(RelayError::Closed {
                        mid_frame: self.decoder.has_partial(),
                    });
                }
                Ok(n) => self.decoder.extend(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn send_event(&mut self, event: &Event) -> Result<(), RelayError> {
        let payload = event.to_bytes()?;
        self.send_framed(&payload)
    }

    /// Read one event.
    ///
    /// A frame that arrives intact but does not decode as an event yields
    /// `Ok(None)`; transport and framing failures are errors.
    pub fn recv_event(&mut self) -> Result<Option<Event>, RelayError> {
        let payload = self.recv_framed()?;
        match Event::from_bytes(&payload) {
            Ok(event) => Ok(Some(event)),
            Err(err) => {
                debug!(%err, len = payload.len(), "frame did not decode as an event");
                Ok(None)
            }
        }
    }
}
