// TCP client for connecting to an event relay.
//
// A `Client` holds at most one connection. The intended use is a caller that
// runs its own loop (a frame timer, a UI tick) and, once per iteration:
// - pushes local events with `send_event`, and
// - calls `drain()` to collect everything the relay has sent since the last
//   call, without blocking.
//
// The socket is switched to non-blocking right after connect, so `drain`
// reads until the OS reports would-block and returns. A frame that is only
// partly received stays buffered in the endpoint and completes on a later
// drain.
//
// Any outcome of a drain other than would-block (the relay closed the
// stream, reset it, sent a malformed frame or an undecodable event, or some
// other transport error) is treated as a lost connection: the events
// collected so far are returned with `connected = false`, and the client
// drops the socket. Reconnecting is up to the caller.

use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use event_relay_protocol::Event;
use tracing::debug;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::RelayError;

/// Result of one `Client::drain`.
#[derive(Debug)]
pub struct DrainReport {
    /// Events received this drain, in arrival order.
    pub events: Vec<Event>,
    /// False once the connection is gone; further drains return nothing.
    pub connected: bool,
}

pub struct Client {
    endpoint: Option<Endpoint<TcpStream>>,
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            endpoint: None,
            config,
        }
    }

    /// Connect to a relay, replacing any existing connection. Failure is not
    /// an error: it is logged, the client stays disconnected, and `false` is
    /// returned.
    pub fn connect_to(&mut self, addr: impl ToSocketAddrs) -> bool {
        self.disconnect();
        let opened = TcpStream::connect(addr).and_then(|stream| {
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            Ok(stream)
        });
        match opened {
            Ok(stream) => {
                debug!(peer = ?stream.peer_addr().ok(), "connected to relay");
                self.endpoint = Some(Endpoint::new(stream, &self.config));
                true
            }
            Err(err) => {
                debug!(%err, "could not connect to relay");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref()?.get_ref().local_addr().ok()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref()?.get_ref().peer_addr().ok()
    }

    fn endpoint_mut(&mut self) -> Result<&mut Endpoint<TcpStream>, RelayError> {
        self.endpoint.as_mut().ok_or(RelayError::NotConnected)
    }

    pub fn send_event(&mut self, event: &Event) -> Result<(), RelayError> {
        self.endpoint_mut()?.send_event(event)
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.endpoint_mut()?.send_raw(bytes)
    }

    /// Collect every event currently available without blocking.
    pub fn drain(&mut self) -> DrainReport {
        let mut events = Vec::new();
        let Some(endpoint) = self.endpoint.as_mut() else {
            return DrainReport {
                events,
                connected: false,
            };
        };
        loop {
            match endpoint.recv_event() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {
                    debug!("relay sent an undecodable event; dropping connection");
                    break;
                }
                Err(RelayError::WouldBlock) => {
                    return DrainReport {
                        events,
                        connected: true,
                    };
                }
                Err(err) => {
                    debug!(%err, "relay connection lost");
                    break;
                }
            }
        }
        self.endpoint = None;
        DrainReport {
            events,
            connected: false,
        }
    }

    /// Close the connection, if any.
    pub fn disconnect(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            if let Err(err) = endpoint.get_ref().shutdown(Shutdown::Both) {
                debug!(%err, "shutdown failed");
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
