// CLI entry point: a forwarding relay.
//
// Runs the relay tick loop forever and forwards every event a client sends
// to every other connected client (never back to the sender). Clients whose
// sockets fail during forwarding are dropped. See `relay.rs` for the tick
// loop itself.
//
// Usage:
//   event-relay [OPTIONS]
//     --port <PORT>          Listen on this port of the discovered local IPv4
//                            address (default: 9882)
//     --bind <ADDR>          Listen on an explicit address instead, e.g.
//                            127.0.0.1:9882
//     --backlog <N>          Listen backlog (default: 5)
//     --timeout-ms <MS>      Readiness wait per tick (default: 500)
//     --max-frame <BYTES>    Largest accepted frame payload (default: 16 MB)
//
// Logging goes through `tracing`; set `RUST_LOG` to override the default
// `event_relay=info` filter. The process exits on SIGINT/SIGTERM; there is
// no state to flush.

use std::str::FromStr;
use std::time::Duration;

use event_relay::{BindTarget, Config, Relay, TickReport};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 9882;

struct RelayOptions {
    bind: BindTarget,
    config: Config,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            bind: BindTarget::Port(DEFAULT_PORT),
            config: Config::default(),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("event_relay=info")),
        )
        .init();

    let options = parse_args();

    let mut relay = match Relay::bind(options.bind, options.config) {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            std::process::exit(1);
        }
    };

    println!("Relay listening on {}", relay.local_addr());
    println!("Press Ctrl+C to stop.");

    loop {
        match relay.tick() {
            Ok(report) => forward(&mut relay, &report),
            Err(e) => {
                error!(%e, "readiness poll failed");
                std::process::exit(1);
            }
        }
    }
}

/// Announce joins and leaves; send each event to everyone but its sender.
fn forward(relay: &mut Relay, report: &TickReport) {
    for client in &report.new_clients {
        info!(id = %client.id, addr = %client.addr, "client connected");
    }

    for event in &report.events {
        let failures = match relay.broadcast(event, event.origin()) {
            Ok(failures) => failures,
            Err(err) => {
                warn!(%err, kind = event.kind(), "could not forward event");
                continue;
            }
        };
        for failure in failures {
            if let Some(addr) = relay.remove_client(failure.id) {
                info!(id = %failure.id, %addr, error = %failure.error, "dropped client after failed send");
            }
        }
    }

    for client in &report.disconnected {
        info!(id = %client.id, addr = %client.addr, "client disconnected");
    }
}

/// Parse command-line arguments into `RelayOptions`. Uses simple
/// `std::env::args()` matching, no clap dependency.
fn parse_args() -> RelayOptions {
    let mut options = RelayOptions::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                options.bind = BindTarget::Port(value(&args, i, "--port requires a valid port number"));
            }
            "--bind" => {
                i += 1;
                options.bind = BindTarget::Addr(value(&args, i, "--bind requires an address like 127.0.0.1:9882"));
            }
            "--backlog" => {
                i += 1;
                options.config.backlog = value(&args, i, "--backlog requires a valid number");
            }
            "--timeout-ms" => {
                i += 1;
                options.config.poll_timeout =
                    Duration::from_millis(value(&args, i, "--timeout-ms requires a valid number"));
            }
            "--max-frame" => {
                i += 1;
                options.config.max_frame_size = value(&args, i, "--max-frame requires a valid number");
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

/// Parse `args[i]`, or print `complaint` and exit.
fn value<T: FromStr>(args: &[String], i: usize, complaint: &str) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
        eprintln!("{complaint}");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: event-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port <PORT>          Listen port on the local IPv4 address (default: {DEFAULT_PORT})");
    println!("  --bind <ADDR>          Listen on an explicit address instead");
    println!("  --backlog <N>          Listen backlog (default: 5)");
    println!("  --timeout-ms <MS>      Readiness wait per tick (default: 500)");
    println!("  --max-frame <BYTES>    Largest accepted frame payload (default: 16777216)");
    println!("  --help, -h             Show this help");
}
