// event_relay: single-threaded event relay and its client.
//
// A relay accepts many TCP clients, reads length-framed `Event`s from them,
// and hands each tick's new clients, events, and disconnects to the
// embedding application, which decides what to send where. Clients keep one
// connection, push events, and drain incoming events without blocking once
// per caller-driven tick.
//
// Module overview:
// - `relay.rs`:     `Relay`: the readiness-multiplexed tick loop (accept, read
//                   at most one event per ready connection, detect failures)
//                   plus send/broadcast/remove for the application.
// - `server.rs`:    `Server`: bind (explicit address or bare port on the
//                   discovered local IPv4 address), listen, accept.
// - `client.rs`:    `Client`: connect, send, and the non-blocking `drain`.
// - `endpoint.rs`:  `Endpoint`: raw/framed/event send and receive over one
//                   stream, shared by the relay and the client.
// - `config.rs`:    `Config`: backlog, poll timeout, frame cap, buffer sizes.
// - `error.rs`:     `RelayError`.
//
// Dependencies: `event_relay_protocol` (framing and the event codec) and
// `mio` for readiness polling. No async runtime, no threads.
//
// The relay can run as a standalone forwarding binary (`main.rs`) or be
// embedded through the library API (`Relay::bind` + `Relay::tick`).

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod relay;
pub mod server;

pub use client::{Client, DrainReport};
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::RelayError;
pub use event_relay_protocol::{ConnectionId, Event, Value};
pub use relay::{ClientInfo, Relay, SendFailure, TickReport};
pub use server::{BindTarget, Server, local_ipv4};
