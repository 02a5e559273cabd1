// Networking configuration shared by the relay, its connections, and clients.
//
// One record is passed to every component at construction instead of
// scattering per-call default parameters. The binary (`main.rs`) builds one
// from command-line flags; embedders and tests usually start from
// `Config::default()` and override a field or two.

use std::time::Duration;

use event_relay_protocol::MAX_FRAME_SIZE;

#[derive(Clone, Debug)]
pub struct Config {
    /// Pending-connection backlog passed to `listen`.
    pub backlog: u32,
    /// Upper bound on how long one `Relay::tick` waits for readiness.
    pub poll_timeout: Duration,
    /// Largest frame payload a peer may declare before it is dropped.
    pub max_frame_size: usize,
    /// Default size of an unframed `recv_raw` read.
    pub raw_recv_size: usize,
    /// How long a write to a full socket buffer is retried before giving up.
    pub send_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backlog: 5,
            poll_timeout: Duration::from_millis(500),
            max_frame_size: MAX_FRAME_SIZE,
            raw_recv_size: 512,
            send_timeout: Duration::from_secs(5),
        }
    }
}
