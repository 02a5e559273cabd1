// Error taxonomy for relay and client networking.
//
// Per-connection failures are values, not panics: the relay converts them
// into disconnect reports and the client into `connected = false`. Only
// construction-time failures (bind, listen, poll setup) are meant to reach
// the embedding application as errors.
//
// `WouldBlock` is not a failure. It is how a non-blocking read says "nothing
// more right now", and it is the normal end of a drain loop. The `From`
// impl below routes `io::ErrorKind::WouldBlock` into that variant so callers
// can match on it without digging into `io::Error`.

use std::io;

use event_relay_protocol::{ConnectionId, EncodeError, FramingError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The peer closed the stream. `mid_frame` is true if it did so after
    /// sending part of a frame.
    #[error("connection closed by peer{}", mid_frame_suffix(.mid_frame))]
    Closed { mid_frame: bool },

    #[error("no data available")]
    WouldBlock,

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("timed out writing to peer")]
    SendTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("server is not listening")]
    NotListening,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("could not discover a local IPv4 address: {0}")]
    AddressDiscovery(#[source] io::Error),
}

fn mid_frame_suffix(mid_frame: &bool) -> &'static str {
    if *mid_frame { " mid-frame" } else { "" }
}

impl RelayError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, RelayError::WouldBlock)
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => RelayError::WouldBlock,
            _ => RelayError::Transport(err),
        }
    }
}
