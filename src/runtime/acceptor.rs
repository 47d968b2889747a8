//! Acceptor loop.
//!
//! Owns the listening socket. Every accepted stream is wrapped in a
//! `BufSock` and pushed to the worker through the new-connection handoff.
//! Connections the worker is done with come back through the
//! terminated-connection handoff and are closed here.

use crate::runtime::connection::BufSock;
use crate::runtime::event_base::{EventBase, Ready};
use crate::runtime::handoff::{HandoffReceiver, HandoffSender, PushError, Signal};
use crate::runtime::transport::Listener;
use mio::Token;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(0);
const TERM_CONN_TOKEN: Token = Token(1);
const NEW_NOTIFY_TOKEN: Token = Token(2);

/// Acceptor ends of the two handoff queues.
pub struct AcceptorHandoff {
    pub new_conn: HandoffSender<Box<BufSock>>,
    pub term_conn: HandoffReceiver<Box<BufSock>>,
}

/// Connection counts seen by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AcceptorStats {
    pub accepted: u64,
    pub rejected: u64,
    pub reclaimed: u64,
}

pub struct Acceptor<L: Listener> {
    listener: L,
    event_base: EventBase,
    ready: Vec<(Token, Ready)>,
    new_conn: HandoffSender<Box<BufSock>>,
    term_conn: HandoffReceiver<Box<BufSock>>,
    timeout: Duration,
    buf_size: usize,
    stats: AcceptorStats,
}

impl<L: Listener> Acceptor<L> {
    pub fn new(
        listener: L,
        handoff: AcceptorHandoff,
        timeout: Duration,
        buf_size: usize,
    ) -> io::Result<Self> {
        let mut event_base = EventBase::new(64)?;
        event_base.add_read(listener.open_id(), LISTENER_TOKEN)?;
        event_base.add_read(handoff.term_conn.notify_id(), TERM_CONN_TOKEN)?;

        Ok(Self {
            listener,
            event_base,
            ready: Vec::with_capacity(64),
            new_conn: handoff.new_conn,
            term_conn: handoff.term_conn,
            timeout,
            buf_size,
            stats: AcceptorStats::default(),
        })
    }

    /// Loop until `running` clears.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        info!("acceptor started");

        while running.load(Ordering::Acquire) {
            self.poll_once()?;
        }

        // whatever the worker already handed back
        self.reclaim();
        info!(stats = ?self.stats, "acceptor stopped");
        Ok(())
    }

    pub fn poll_once(&mut self) -> io::Result<usize> {
        let mut ready = std::mem::take(&mut self.ready);
        let n = self.event_base.wait(self.timeout, &mut ready)?;

        for &(token, events) in &ready {
            match token {
                LISTENER_TOKEN => self.accept_connections(),
                TERM_CONN_TOKEN if events.is_readable() => self.reclaim(),
                NEW_NOTIFY_TOKEN if events.is_writable() => self.retry_notify(),
                _ => trace!(token = token.0, ?events, "ignored acceptor event"),
            }
        }

        self.ready = ready;
        Ok(n)
    }

    fn accept_connections(&mut self) {
        loop {
            if self.new_conn.is_full() {
                match self.listener.reject() {
                    Ok(()) => {
                        warn!(capacity = self.new_conn.capacity(), "new connection queue is full, rejecting");
                        self.stats.rejected += 1;
                        continue;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        error!(error = %e, "reject error");
                        break;
                    }
                }
            }

            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let conn = Box::new(BufSock::new(Box::new(stream), self.buf_size));
                    debug!(peer = %peer, "accepted connection");
                    self.hand_off(conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    fn hand_off(&mut self, conn: Box<BufSock>) {
        match self.new_conn.push(conn) {
            Ok(Signal::Sent) => self.stats.accepted += 1,
            Ok(Signal::Pending) => {
                self.stats.accepted += 1;
                self.await_notify_writable();
            }
            Err(PushError::Full(mut conn)) => {
                warn!("new connection queue is full, rejecting");
                self.stats.rejected += 1;
                conn.close();
            }
            Err(PushError::Notify(e)) => {
                self.stats.accepted += 1;
                error!(error = %e, "could not write to notification pipe");
            }
        }
    }

    fn retry_notify(&mut self) {
        match self.new_conn.flush_signals() {
            Ok(Signal::Sent) => {
                if let Err(e) = self.event_base.del(self.new_conn.notify_id()) {
                    warn!(error = %e, "could not clear pipe retry");
                }
            }
            Ok(Signal::Pending) => self.await_notify_writable(),
            Err(e) => error!(error = %e, "could not write to notification pipe"),
        }
    }

    fn await_notify_writable(&mut self) {
        if let Err(e) = self
            .event_base
            .add_write(self.new_conn.notify_id(), NEW_NOTIFY_TOKEN)
        {
            error!(error = %e, "could not register pipe for retry");
        }
    }

    /// Close every connection the worker has returned.
    fn reclaim(&mut self) {
        let stats = &mut self.stats;
        let result = self.term_conn.drain(|mut conn| {
            trace!(conn = ?conn, "closing returned connection");
            conn.close();
            stats.reclaimed += 1;
        });

        match result {
            Ok(drain) if drain.missing() > 0 => {
                warn!(
                    missing = drain.missing(),
                    "event number does not match terminated connection queue"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "not reclaiming connections due to pipe error"),
        }
    }

    #[cfg(test)]
    fn stats(&self) -> AcceptorStats {
        self.stats
    }
}
