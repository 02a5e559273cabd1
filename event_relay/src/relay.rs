// The relay: one listening socket, many client connections, one thread.
//
// `Relay` owns the `Server`, a `mio::Poll`, and the table of live
// connections. The embedding application calls `tick()` in a loop; each tick
// waits (up to `Config::poll_timeout`) for readiness, then:
//
// 1. accepts every pending connection on the listener and registers it,
// 2. reads at most one event from each ready connection, tagging it with the
//    connection's id,
// 3. removes every connection that errored, closed, sent a malformed frame,
//    or sent an undecodable event,
//
// and returns a `TickReport` of new clients, new events, and disconnected
// clients. What to do with the events (forward, echo, drop) is the
// application's business; it answers through `send_event_to`, `broadcast`,
// and `remove_client`.
//
// Connection identity: each accepted connection gets a `ConnectionId` from a
// monotonic counter (starting at 1; token 0 is the listener). The same id is
// the key into `connections` and the `mio::Token` of the registration, and
// `remove_client` drops both together, so a connection is either fully
// tracked or not tracked at all.
//
// Readiness with `mio` is edge-triggered, while the relay deliberately reads
// only one event per connection per tick. A connection that produced an
// event may still have more frames buffered in its endpoint or in the
// socket, and the OS will not report it again. Such connections go into
// `pending` and are read again next tick without waiting for a readiness
// edge; the poll timeout is zero while anything is pending. A pending
// connection leaves the set once a read reports would-block, which also
// re-arms its edge notification.
//
// Not thread-safe by design: all state is mutated inside `&mut self`
// methods. Embedders that need to share a relay across threads must wrap it
// in a mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;

use event_relay_protocol::{ConnectionId, Event, encode_frame};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::server::{BindTarget, Server};

const LISTENER: Token = Token(0);

/// Readiness events fetched per poll. More ready sockets than this are
/// picked up on the following tick.
const EVENTS_CAPACITY: usize = 256;

fn token_for(id: ConnectionId) -> Token {
    Token(id.0 as usize)
}

fn id_for(token: Token) -> ConnectionId {
    ConnectionId(token.0 as u64)
}

/// A connected client as reported to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
}

/// Everything that happened during one `tick`.
#[derive(Debug, Default)]
pub struct TickReport {
    pub new_clients: Vec<ClientInfo>,
    /// At most one event per connection, each with `origin` set.
    pub events: Vec<Event>,
    pub disconnected: Vec<ClientInfo>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.new_clients.is_empty() && self.events.is_empty() && self.disconnected.is_empty()
    }
}

/// A failed write during `broadcast`.
#[derive(Debug)]
pub struct SendFailure {
    pub id: ConnectionId,
    pub error: RelayError,
}

struct Connection {
    endpoint: Endpoint<TcpStream>,
    addr: SocketAddr,
}

pub struct Relay {
    server: Server,
    poll: Poll,
    events: Events,
    connections: BTreeMap<ConnectionId, Connection>,
    /// Connections that yielded an event last tick and may hold more.
    pending: BTreeSet<ConnectionId>,
    /// Set when `accept` failed with something other than would-block, so
    /// the listener is retried without waiting for a new readiness edge.
    retry_accept: bool,
    next_id: u64,
    config: Config,
}

impl Relay {
    /// Start relaying on an already bound server: listen with
    /// `config.backlog` and register the listener for readiness.
    pub fn new(mut server: Server, config: Config) -> Result<Self, RelayError> {
        server.listen(config.backlog)?;
        let poll = Poll::new()?;
        let listener = server.listener_mut().ok_or(RelayError::NotListening)?;
        poll.registry()
            .register(listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            server,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            connections: BTreeMap::new(),
            pending: BTreeSet::new(),
            retry_accept: false,
            next_id: 1,
            config,
        })
    }

    /// Bind a new server and start relaying on it.
    pub fn bind(target: impl Into<BindTarget>, config: Config) -> Result<Self, RelayError> {
        Self::new(Server::bind(target)?, config)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one iteration with the configured poll timeout.
    pub fn tick(&mut self) -> Result<TickReport, RelayError> {
        self.tick_with_timeout(self.config.poll_timeout)
    }

    /// Run one iteration, waiting at most `timeout` for readiness.
    ///
    /// Per-connection failures never surface as errors here; they become
    /// entries in `TickReport::disconnected`. Only a failure of the poll
    /// itself is returned.
    pub fn tick_with_timeout(&mut self, timeout: Duration) -> Result<TickReport, RelayError> {
        let mut report = TickReport::default();

        let wait = if self.pending.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(wait)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        let mut listener_ready = std::mem::take(&mut self.retry_accept);
        let mut readable = std::mem::take(&mut self.pending);
        let mut errored = BTreeSet::new();
        for event in self.events.iter() {
            if event.token() == LISTENER {
                listener_ready = true;
                continue;
            }
            let id = id_for(event.token());
            if event.is_error() {
                errored.insert(id);
            } else if event.is_readable() || event.is_read_closed() {
                readable.insert(id);
            }
        }

        if listener_ready {
            self.accept_pending(&mut report.new_clients);
        }

        for id in readable {
            if errored.contains(&id) {
                continue;
            }
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            match conn.endpoint.recv_event() {
                Ok(Some(mut event)) => {
                    event.set_origin(id);
                    report.events.push(event);
                    self.pending.insert(id);
                }
                Ok(None) => {
                    debug!(%id, "undecodable event; dropping connection");
                    errored.insert(id);
                }
                Err(RelayError::WouldBlock) => {}
                Err(err) => {
                    debug!(%id, %err, "connection failed");
                    errored.insert(id);
                }
            }
        }

        for id in errored {
            if let Some(addr) = self.remove_client(id) {
                report.disconnected.push(ClientInfo { id, addr });
            }
        }

        Ok(report)
    }

    /// Accept until the listener's queue is empty.
    fn accept_pending(&mut self, new_clients: &mut Vec<ClientInfo>) {
        loop {
            let (mut stream, addr) = match self.server.accept() {
                Ok(accepted) => accepted,
                Err(RelayError::WouldBlock) => return,
                Err(err) => {
                    warn!(%err, "accept failed; retrying next tick");
                    self.retry_accept = true;
                    return;
                }
            };
            let id = ConnectionId(self.next_id);
            self.next_id += 1;
            if let Err(err) =
                self.poll
                    .registry()
                    .register(&mut stream, token_for(id), Interest::READABLE)
            {
                warn!(%addr, %err, "could not register connection; dropping it");
                continue;
            }
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%id, %err, "could not set TCP_NODELAY");
            }
            self.connections.insert(
                id,
                Connection {
                    endpoint: Endpoint::new(stream, &self.config),
                    addr,
                },
            );
            debug!(%id, %addr, "accepted connection");
            new_clients.push(ClientInfo { id, addr });
        }
    }

    /// Stop tracking a connection and close it. Returns its peer address, or
    /// `None` if the id was not tracked.
    pub fn remove_client(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let mut conn = self.connections.remove(&id)?;
        self.pending.remove(&id);
        if let Err(err) = self.poll.registry().deregister(conn.endpoint.get_mut()) {
            debug!(%id, %err, "deregister failed");
        }
        if let Err(err) = conn.endpoint.get_ref().shutdown(Shutdown::Both) {
            debug!(%id, %err, "shutdown failed");
        }
        Some(conn.addr)
    }

    pub fn send_event_to(&mut self, id: ConnectionId, event: &Event) -> Result<(), RelayError> {
        self.connection_mut(id)?.endpoint.send_event(event)
    }

    pub fn send_raw_to(&mut self, id: ConnectionId, bytes: &[u8]) -> Result<(), RelayError> {
        self.connection_mut(id)?.endpoint.send_raw(bytes)
    }

    /// Send `event` to every client except `exclude`.
    ///
    /// The event is encoded once; an encoding failure is the only error
    /// returned. A write failure on one client does not stop delivery to the
    /// rest; each one is logged and listed in the result so the application
    /// can decide whether to `remove_client` it.
    pub fn broadcast(
        &mut self,
        event: &Event,
        exclude: Option<ConnectionId>,
    ) -> Result<Vec<SendFailure>, RelayError> {
        let payload = event.to_bytes()?;
        let frame = encode_frame(&payload, self.config.max_frame_size)?;
        let mut failures = Vec::new();
        for (&id, conn) in &mut self.connections {
            if Some(id) == exclude {
                continue;
            }
            if let Err(error) = conn.endpoint.send_raw(&frame) {
                warn!(%id, addr = %conn.addr, %error, "broadcast send failed");
                failures.push(SendFailure { id, error });
            }
        }
        Ok(failures)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, RelayError> {
        self.connections
            .get_mut(&id)
            .ok_or(RelayError::UnknownConnection(id))
    }

    /// All live clients, in id (accept) order.
    pub fn clients(&self) -> impl Iterator<Item = ClientInfo> + '_ {
        self.connections
            .iter()
            .map(|(&id, conn)| ClientInfo {
                id,
                addr: conn.addr,
            })
    }

    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn peer_addr(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).map(|conn| conn.addr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpStream as StdTcpStream};
    use std::time::Instant;

    use event_relay_protocol::write_frame;

    use super::*;

    const DEADLINE: Duration = Duration::from_secs(5);
    const SHORT_TICK: Duration = Duration::from_millis(20);

    fn relay() -> Relay {
        Relay::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), Config::default()).unwrap()
    }

    /// Tick until `done` accepts the accumulated reports, or panic.
    fn tick_until(relay: &mut Relay, mut done: impl FnMut(&TickReport) -> bool) -> TickReport {
        let start = Instant::now();
        let mut all = TickReport::default();
        while start.elapsed() < DEADLINE {
            let report = relay.tick_with_timeout(SHORT_TICK).unwrap();
            all.new_clients.extend(report.new_clients);
            all.events.extend(report.events);
            all.disconnected.extend(report.disconnected);
            if done(&all) {
                return all;
            }
        }
        panic!("relay did not reach the expected state: {all:?}");
    }

    fn accept_one(relay: &mut Relay) -> (StdTcpStream, ConnectionId) {
        let stream = StdTcpStream::connect(relay.local_addr()).unwrap();
        let report = tick_until(relay, |r| !r.new_clients.is_empty());
        (stream, report.new_clients[0].id)
    }

    #[test]
    fn ids_start_at_one_and_are_not_reused() {
        let mut relay = relay();
        let (first, id1) = accept_one(&mut relay);
        assert_eq!(id1, ConnectionId(1));
        drop(first);
        tick_until(&mut relay, |r| !r.disconnected.is_empty());

        let (_second, id2) = accept_one(&mut relay);
        assert_eq!(id2, ConnectionId(2));
    }

    #[test]
    fn removed_connection_leaves_every_table() {
        let mut relay = relay();
        let (mut stream, id) = accept_one(&mut relay);
        write_frame(&mut stream, &Event::new("a").to_bytes().unwrap()).unwrap();
        write_frame(&mut stream, &Event::new("b").to_bytes().unwrap()).unwrap();
        tick_until(&mut relay, |r| !r.events.is_empty());
        assert!(relay.pending.contains(&id));

        assert!(relay.remove_client(id).is_some());
        assert!(!relay.contains(id));
        assert!(!relay.pending.contains(&id));
        assert_eq!(relay.peer_addr(id), None);
        assert_eq!(relay.remove_client(id), None);

        // The buffered second event is never reported for a removed client.
        let report = relay.tick_with_timeout(SHORT_TICK).unwrap();
        assert!(report.events.is_empty());
    }

    #[test]
    fn pending_clears_once_connection_runs_dry() {
        let mut relay = relay();
        let (mut stream, id) = accept_one(&mut relay);
        write_frame(&mut stream, &Event::new("only").to_bytes().unwrap()).unwrap();
        tick_until(&mut relay, |r| !r.events.is_empty());
        assert!(relay.pending.contains(&id));

        let report = relay.tick_with_timeout(SHORT_TICK).unwrap();
        assert!(report.is_empty());
        assert!(!relay.pending.contains(&id));
        assert!(relay.contains(id));
    }

    #[test]
    fn raw_bytes_reach_the_client() {
        let mut relay = relay();
        let (mut stream, id) = accept_one(&mut relay);
        relay.send_raw_to(id, b"0000000000000002hi").unwrap();
        stream.set_read_timeout(Some(DEADLINE)).unwrap();
        let payload = event_relay_protocol::read_frame(&mut stream).unwrap();
        assert_eq!(payload, b"hi".to_vec());
    }

    #[test]
    fn listens_with_the_configured_backlog() {
        let config = Config {
            backlog: 1,
            ..Config::default()
        };
        let mut relay =
            Relay::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), config).unwrap();
        assert_eq!(relay.config().backlog, 1);
        assert_ne!(relay.local_addr().port(), 0);
        let (_stream, id) = accept_one(&mut relay);
        assert_eq!(id, ConnectionId(1));
    }

    #[test]
    fn removing_a_reset_connection_still_clears_it() {
        let mut relay = relay();
        let (stream, id) = accept_one(&mut relay);
        // Unread data on the peer side makes its close a reset.
        relay.send_raw_to(id, b"0000000000000002hi").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(stream);
        std::thread::sleep(Duration::from_millis(50));

        assert!(relay.remove_client(id).is_some());
        assert!(!relay.contains(id));
        assert_eq!(relay.client_count(), 0);
    }

    #[test]
    fn sending_to_unknown_id_fails() {
        let mut relay = relay();
        let err = relay
            .send_event_to(ConnectionId(42), &Event::new("x"))
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownConnection(ConnectionId(42))));
    }

    #[test]
    fn broadcast_rejects_unencodable_event_before_sending() {
        let mut relay = relay();
        let (_stream, _id) = accept_one(&mut relay);
        let bad = Event::new("bad").with("x", f64::INFINITY);
        assert!(matches!(
            relay.broadcast(&bad, None),
            Err(RelayError::Encode(_))
        ));
    }
}
