// Core ID types for the relay protocol.
//
// `ConnectionId` is the opaque handle the relay assigns to each accepted
// connection. The relay keys its connection table, its readiness
// registrations, and the `origin` annotation on received events by this
// handle rather than by the socket object itself. Ids are handed out from a
// monotonic counter and never reused, so a stale id can never alias a newer
// connection. It is a local handle only and never goes on the wire.

use std::fmt;

/// Relay-assigned connection handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
