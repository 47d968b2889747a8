//! Connection-serving runtime.
//!
//! Two threads cooperate through a pair of handoff queues:
//! - the acceptor owns the listening socket and hands each accepted
//!   connection to the worker
//! - the worker multiplexes every connection it owns, drives a protocol
//!   `Processor` on readiness, and hands terminated connections back
//!
//! Each connection is owned by exactly one thread at any instant.

pub mod acceptor;
pub mod clock;
pub mod connection;
pub mod event_base;
pub mod handoff;
pub mod metrics;
pub mod processor;
pub mod transport;
pub mod worker;

pub use acceptor::{Acceptor, AcceptorHandoff};
pub use metrics::WorkerMetrics;
pub use worker::{Worker, WorkerHandoff};

use crate::config::{Config, ProtocolType};
use crate::protocols::echo::EchoProcessor;
use crate::protocols::ping::PingProcessor;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};
use transport::TcpAcceptor;

/// Create both handoff queues, split into acceptor and worker ends.
pub fn handoff_pair(capacity: usize) -> io::Result<(AcceptorHandoff, WorkerHandoff)> {
    let (new_tx, new_rx) = handoff::channel(capacity)?;
    let (term_tx, term_rx) = handoff::channel(capacity)?;

    Ok((
        AcceptorHandoff {
            new_conn: new_tx,
            term_conn: term_rx,
        },
        WorkerHandoff {
            new_conn: new_rx,
            term_conn: term_tx,
        },
    ))
}

/// Run the server until the process exits.
///
/// A worker that cannot set up or whose poller fails ends the process
/// with `WorkerError::exit_code`.
pub fn run(config: Config) -> io::Result<()> {
    let addr: SocketAddr = config.listen.parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen address {}: {e}", config.listen),
        )
    })?;

    let (acceptor_side, worker_side) = handoff_pair(config.queue_capacity)?;
    let metrics = Arc::new(WorkerMetrics::new());
    let running = Arc::new(AtomicBool::new(true));

    let mut worker = match Worker::setup(0, Some(&config.worker), Arc::clone(&metrics), worker_side)
    {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "worker setup failed");
            std::process::exit(e.exit_code());
        }
    };

    let protocol = config.protocol;
    let clock = worker.clock();
    let worker_running = Arc::clone(&running);
    let handle = thread::Builder::new()
        .name("worker".to_string())
        .spawn(move || {
            let result = match protocol {
                ProtocolType::Ping => worker.run(&mut PingProcessor::new(clock), &worker_running),
                ProtocolType::Echo => worker.run(&mut EchoProcessor::new(clock), &worker_running),
            };
            if let Err(e) = result {
                error!(error = %e, "worker stopped");
                std::process::exit(e.exit_code());
            }
            worker.teardown();
        })?;

    let listener = TcpAcceptor::bind(addr)?;
    info!(addr = %listener.local_addr()?, "listening");

    let mut acceptor = Acceptor::new(
        listener,
        acceptor_side,
        config.worker.timeout,
        config.buf_size,
    )?;
    acceptor.run(&running)?;

    if handle.join().is_err() {
        error!("worker thread panicked");
    }
    Ok(())
}
