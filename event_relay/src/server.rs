// Listening socket for the relay.
//
// `Server` owns the passive TCP socket and nothing else: bind, listen, and
// accept. Connection bookkeeping belongs to `Relay` (see `relay.rs`), which
// registers the listener with its readiness poll and calls `accept` only
// when the listener reports readable.
//
// The listener is non-blocking (it comes from `mio`), so `accept` returns
// `RelayError::WouldBlock` once the pending-connection queue is empty.
//
// Binding to a bare port resolves "this host's outward-facing IPv4 address"
// first (`local_ipv4`): a UDP socket is connected toward a public address
// and its local endpoint is read back. No packet is sent; the OS routing
// table picks the interface. This is best-effort and fails on hosts with no
// route to the outside, in which case callers should bind an explicit
// address instead.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use mio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::debug;

use crate::error::RelayError;

/// Where the routing table is asked to route to during `local_ipv4`.
const DISCOVERY_TARGET: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// What a server binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindTarget {
    /// A port on the auto-discovered local IPv4 address.
    Port(u16),
    /// An explicit address, bound as-is.
    Addr(SocketAddr),
}

impl From<u16> for BindTarget {
    fn from(port: u16) -> Self {
        BindTarget::Port(port)
    }
}

impl From<SocketAddr> for BindTarget {
    fn from(addr: SocketAddr) -> Self {
        BindTarget::Addr(addr)
    }
}

enum State {
    Bound(TcpSocket),
    Listening(TcpListener),
    /// Left behind by a failed `listen`.
    Failed,
}

pub struct Server {
    address: SocketAddr,
    state: State,
}

impl Server {
    /// Create a socket and bind it. Bind failures propagate.
    pub fn bind(target: impl Into<BindTarget>) -> Result<Self, RelayError> {
        let address = match target.into() {
            BindTarget::Port(port) => SocketAddr::new(IpAddr::V4(local_ipv4()?), port),
            BindTarget::Addr(address) => address,
        };
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address)?;
        debug!(%address, "bound relay socket");
        Ok(Self {
            address,
            state: State::Bound(socket),
        })
    }

    /// Mark the socket passive. Calling it again once listening is a no-op.
    pub fn listen(&mut self, backlog: u32) -> Result<(), RelayError> {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Bound(socket) => {
                let listener = socket.listen(backlog)?;
                self.address = listener.local_addr()?;
                self.state = State::Listening(listener);
                debug!(address = %self.address, backlog, "listening");
                Ok(())
            }
            State::Listening(listener) => {
                self.state = State::Listening(listener);
                Ok(())
            }
            State::Failed => Err(RelayError::NotListening),
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.state, State::Listening(_))
    }

    /// Accept one pending connection. The returned stream is non-blocking.
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr), RelayError> {
        match &self.state {
            State::Listening(listener) => Ok(listener.accept()?),
            _ => Err(RelayError::NotListening),
        }
    }

    /// The bound address. Once listening this is the actual address, so a
    /// requested port of 0 shows the port the OS picked.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub(crate) fn listener_mut(&mut self) -> Option<&mut TcpListener> {
        match &mut self.state {
            State::Listening(listener) => Some(listener),
            _ => None,
        }
    }
}

/// Best-effort discovery of this host's outward-routable IPv4 address.
pub fn local_ipv4() -> Result<Ipv4Addr, RelayError> {
    let discover = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(DISCOVERY_TARGET)?;
        Ok(socket.local_addr()?.ip())
    };
    match discover().map_err(RelayError::AddressDiscovery)? {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(RelayError::AddressDiscovery(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("routing table reported {other}"),
        ))),
    }
}
