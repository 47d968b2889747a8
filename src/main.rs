//! data-worker: a two-thread connection server.
//!
//! An acceptor thread accepts TCP connections and hands them to a data
//! worker over a lock-free queue paired with a notification pipe. The
//! worker multiplexes its connections, runs a request/response protocol
//! on them, and hands terminated connections back.
//!
//! Protocols:
//! - `ping`: `PING\r\n` answered with `PONG\r\n`
//! - `echo`: length-prefixed payloads echoed back
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        protocol = ?config.protocol,
        queue_capacity = config.queue_capacity,
        buf_size = config.buf_size,
        worker_timeout_ms = config.worker.timeout.as_millis() as u64,
        worker_nevent = config.worker.nevent,
        "Starting data-worker"
    );

    runtime::run(config)?;
    Ok(())
}
