// Length-prefixed frame codec shared by the relay and its clients.
//
// Every frame on the wire is a fixed-width header of `HEADER_SIZE` ASCII
// decimal digits (zero-padded) followed by exactly that many payload bytes.
// The header width never changes for a protocol version, so a receiver always
// knows how many bytes to read before it can interpret anything, and no
// delimiter escaping is needed.
//
// Two reading styles are provided:
// - `read_frame` / `write_frame` operate on blocking `Read`/`Write` streams
//   and move exactly one frame per call.
// - `FrameDecoder` is fed whatever bytes a non-blocking read produced and
//   yields complete frames as they become available, holding a partial frame
//   between calls. The relay and the client both read through it.
//
// The header format can express lengths up to 10^16 - 1, far more than any
// receiver should buffer. `MAX_FRAME_SIZE` (16 MB) is the default cap on the
// declared payload length; a header above the cap is rejected as soon as the
// header itself is complete, before any payload is buffered.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Width of the decimal length header, in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest payload length a 16-digit header can express.
pub const MAX_HEADER_VALUE: u64 = 9_999_999_999_999_999;

/// Default cap on a single frame's payload (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding frame headers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid frame header {header:?}: expected {HEADER_SIZE} ASCII digits")]
    InvalidHeader { header: String },

    #[error("payload length {len} does not fit in a {HEADER_SIZE}-digit header")]
    LengthOverflow { len: u64 },

    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: u64, max: usize },
}

/// Encode a payload length as a zero-padded 16-digit ASCII header.
pub fn encode_header(len: usize) -> Result<[u8; HEADER_SIZE], FramingError> {
    let len = u64::try_from(len).unwrap_or(u64::MAX);
    if len > MAX_HEADER_VALUE {
        return Err(FramingError::LengthOverflow { len });
    }
    let mut header = [b'0'; HEADER_SIZE];
    let mut rest = len;
    for slot in header.iter_mut().rev() {
        *slot = b'0' + (rest % 10) as u8;
        rest /= 10;
    }
    Ok(header)
}

/// Parse a 16-digit ASCII header back into a payload length.
pub fn decode_header(header: &[u8]) -> Result<u64, FramingError> {
    if header.len() != HEADER_SIZE || !header.iter().all(u8::is_ascii_digit) {
        return Err(FramingError::InvalidHeader {
            header: String::from_utf8_lossy(header).into_owned(),
        });
    }
    Ok(header
        .iter()
        .fold(0u64, |acc, digit| acc * 10 + u64::from(digit - b'0')))
}

/// Check a declared payload length against a frame size cap.
fn check_len(len: u64, max: usize) -> Result<usize, FramingError> {
    match usize::try_from(len) {
        Ok(len) if len <= max => Ok(len),
        _ => Err(FramingError::TooLarge { len, max }),
    }
}

/// Build one complete frame (header followed by payload) in a single buffer,
/// so it can be written as one logical unit.
pub fn encode_frame(payload: &[u8], max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
    if payload.len() > max_frame_size {
        return Err(FramingError::TooLarge {
            len: u64::try_from(payload.len()).unwrap_or(u64::MAX),
            max: max_frame_size,
        });
    }
    let header = encode_header(payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Write one frame to a blocking stream.
///
/// Returns `InvalidInput` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(payload, MAX_FRAME_SIZE)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from a blocking stream.
///
/// Returns `UnexpectedEof` if the stream closes before or during a frame, and
/// `InvalidData` if the header is not 16 digits or declares more than
/// `MAX_FRAME_SIZE` bytes.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let len = decode_header(&header)
        .and_then(|len| check_len(len, MAX_FRAME_SIZE))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Incremental frame decoder for one connection.
///
/// Bytes go in through `extend` in whatever chunks the transport delivered;
/// complete payloads come out of `next_frame` in order. A frame split across
/// many reads stays buffered until its last byte arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame payload, if one is fully buffered.
    ///
    /// An invalid or oversized header is an error every time it is seen; the
    /// stream cannot be resynchronized after one, so the caller should drop
    /// the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let Some(header) = self.buf.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let len = check_len(decode_header(header)?, self.max_frame_size)?;
        let end = HEADER_SIZE + len;
        let Some(payload) = self.buf.get(HEADER_SIZE..end) else {
            return Ok(None);
        };
        let payload = payload.to_vec();
        self.buf.drain(..end);
        Ok(Some(payload))
    }

    /// Number of bytes received but not yet handed out.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// True if some bytes of an unfinished frame are buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Remove and return up to `max` raw buffered bytes, bypassing framing.
    pub fn take_buffered(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}
