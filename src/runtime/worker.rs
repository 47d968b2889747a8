//! Worker event loop.
//!
//! One worker owns a poller and every connection handed to it by the
//! acceptor. Readiness on a connection drives a small state machine:
//! fill the read buffer, let the processor turn requests into responses,
//! flush the write buffer. A flush that would block switches the
//! connection to write interest only, so no more input is consumed until
//! the peer drains what is already queued. Terminated connections go back
//! to the acceptor through the terminated-connection handoff.
//!
//! ```text
//!   acceptor ──push──▶ [new ring] ──byte──▶ pipe ──READABLE──▶ intake
//!                                                               │
//!   acceptor ◀──pop─── [term ring] ◀──byte── return path ◀──────┘
//! ```

use crate::config::WorkerOptions;
use crate::runtime::clock::CoarseClock;
use crate::runtime::connection::{BufSock, ConnState, Flush, Owner};
use crate::runtime::event_base::{EventBase, Ready};
use crate::runtime::handoff::{Drain, HandoffReceiver, HandoffSender, PushError, Signal};
use crate::runtime::metrics::WorkerMetrics;
use crate::runtime::processor::Processor;
use mio::{Interest, Token};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Read readiness on the new-connection pipe.
pub const NEW_CONN_TOKEN: Token = Token(usize::MAX);
/// Write readiness on the terminated-connection pipe (signal retry).
pub const TERM_NOTIFY_TOKEN: Token = Token(usize::MAX - 1);

/// Exit status for an unusable event base (sysexits `EX_CONFIG`).
const EX_CONFIG: i32 = 78;

/// Worker ends of the two handoff queues.
pub struct WorkerHandoff {
    /// Connections accepted by the acceptor, waiting for intake.
    pub new_conn: HandoffReceiver<Box<BufSock>>,
    /// Connections the worker is done with.
    pub term_conn: HandoffSender<Box<BufSock>>,
}

/// Failures that stop the worker.
#[derive(Debug)]
pub enum WorkerError {
    /// The poller could not be created.
    EventBase(io::Error),
    /// The new-connection pipe could not be registered.
    Register(io::Error),
    /// Waiting on the poller failed.
    Wait(io::Error),
    /// `run` was called after `teardown`.
    NotSetUp,
}

impl WorkerError {
    /// Process exit status matching the failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::EventBase(_) | WorkerError::Register(_) => EX_CONFIG,
            WorkerError::Wait(_) | WorkerError::NotSetUp => 1,
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::EventBase(e) => write!(f, "could not create event base: {e}"),
            WorkerError::Register(e) => write!(f, "could not register notification pipe: {e}"),
            WorkerError::Wait(e) => write!(f, "event wait failed: {e}"),
            WorkerError::NotSetUp => write!(f, "worker has not been set up"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::EventBase(e) | WorkerError::Register(e) | WorkerError::Wait(e) => Some(e),
            WorkerError::NotSetUp => None,
        }
    }
}

/// Per-thread worker context.
pub struct Worker {
    id: usize,
    timeout: Duration,
    event_base: Option<EventBase>,
    ready: Vec<(Token, Ready)>,
    conns: Slab<Box<BufSock>>,
    new_conn: HandoffReceiver<Box<BufSock>>,
    term_conn: HandoffSender<Box<BufSock>>,
    metrics: Arc<WorkerMetrics>,
    clock: Arc<CoarseClock>,
}

impl Worker {
    /// Create the poller and start listening on the new-connection pipe.
    ///
    /// `None` options fall back to the defaults.
    pub fn setup(
        id: usize,
        options: Option<&WorkerOptions>,
        metrics: Arc<WorkerMetrics>,
        handoff: WorkerHandoff,
    ) -> Result<Self, WorkerError> {
        let options = options.copied().unwrap_or_default();
        info!(
            worker = id,
            timeout_ms = options.timeout.as_millis() as u64,
            nevent = options.nevent,
            "set up worker"
        );

        let mut event_base = EventBase::new(options.nevent).map_err(WorkerError::EventBase)?;
        event_base
            .add_read(handoff.new_conn.notify_id(), NEW_CONN_TOKEN)
            .map_err(WorkerError::Register)?;

        Ok(Self {
            id,
            timeout: options.timeout,
            event_base: Some(event_base),
            ready: Vec::with_capacity(options.nevent),
            conns: Slab::new(),
            new_conn: handoff.new_conn,
            term_conn: handoff.term_conn,
            metrics,
            clock: Arc::new(CoarseClock::new()),
        })
    }

    /// Release the poller and close any connection still held.
    pub fn teardown(&mut self) {
        info!(worker = self.id, "tear down worker");

        if self.event_base.take().is_none() {
            warn!(worker = self.id, "worker has never been set up");
            return;
        }
        for mut conn in self.conns.drain() {
            conn.close();
        }
    }

    /// Loop until `running` clears. Only a poller failure ends it early.
    pub fn run<P: Processor>(
        &mut self,
        processor: &mut P,
        running: &AtomicBool,
    ) -> Result<(), WorkerError> {
        info!(worker = self.id, "worker event loop started");

        while running.load(Ordering::Acquire) {
            self.poll_once(processor)?;
        }

        info!(
            worker = self.id,
            conns = self.conns.len(),
            stats = ?self.metrics.snapshot(),
            "worker event loop stopped"
        );
        Ok(())
    }

    /// One wait cycle: block for readiness, then dispatch every ready source.
    pub fn poll_once<P: Processor>(&mut self, processor: &mut P) -> Result<usize, WorkerError> {
        let base = self.event_base.as_mut().ok_or(WorkerError::NotSetUp)?;
        let mut ready = std::mem::take(&mut self.ready);

        let n = base
            .wait(self.timeout, &mut ready)
            .map_err(WorkerError::Wait)?;

        WorkerMetrics::incr(&self.metrics.event_loop);
        WorkerMetrics::incr_n(&self.metrics.event_total, n as u64);
        self.clock.update();

        for &(token, events) in &ready {
            self.dispatch(processor, token, events);
        }

        self.ready = ready;
        Ok(n)
    }

    /// Handle one ready source. Bits are handled read, then write, then error.
    pub fn dispatch<P: Processor>(&mut self, processor: &mut P, token: Token, ready: Ready) {
        trace!(worker = self.id, token = token.0, ?ready, "worker event");

        match token {
            NEW_CONN_TOKEN | TERM_NOTIFY_TOKEN => self.pipe_event(processor, token, ready),
            Token(key) => self.conn_event(processor, key, ready),
        }
    }

    fn pipe_event<P: Processor>(&mut self, processor: &mut P, token: Token, ready: Ready) {
        if ready.is_readable() && token == NEW_CONN_TOKEN {
            WorkerMetrics::incr(&self.metrics.event_read);
            self.add_pending_streams(processor);
        }
        if ready.is_writable() && token == TERM_NOTIFY_TOKEN {
            WorkerMetrics::incr(&self.metrics.event_write);
            self.pipe_write();
        }
        if ready.is_error() {
            WorkerMetrics::incr(&self.metrics.event_error);
            error!(worker = self.id, token = token.0, "error event received on pipe");
        }
    }

    fn conn_event<P: Processor>(&mut self, processor: &mut P, key: usize, ready: Ready) {
        if !self.conns.contains(key) {
            trace!(worker = self.id, token = key, "event for returned connection");
            return;
        }

        if ready.is_readable() {
            trace!(token = key, "processing read event");
            WorkerMetrics::incr(&self.metrics.event_read);
            self.event_read(processor, key);
        }

        if ready.is_writable() && self.conns[key].is_active() {
            // only registered for write after a previous flush was cut short
            trace!(token = key, "processing write event");
            WorkerMetrics::incr(&self.metrics.event_write);
            if self.event_write(processor, key) == Flush::Complete {
                self.register(key, Interest::READABLE);
            }
        }

        if ready.is_error() {
            WorkerMetrics::incr(&self.metrics.event_error);
            self.conns[key].set_state(ConnState::Error);
        }

        if self.conns[key].is_closing() {
            let conn = self.conns.remove(key);
            self.ret_stream(processor, conn);
        }
    }

    fn event_read<P: Processor>(&mut self, processor: &mut P, key: usize) {
        let conn = &mut self.conns[key];

        let n = conn.fill();
        trace!(token = key, bytes = n, "read on connection");
        if conn.state() == ConnState::Error {
            return;
        }

        let (rbuf, wbuf, data) = conn.parts();
        if let Err(e) = processor.read(rbuf, wbuf, data) {
            debug!(token = key, reason = %e, "processor signals connection termination");
            conn.set_state(ConnState::Terminating);
            return;
        }

        if !conn.wbuf().is_empty() {
            trace!(token = key, "attempt to write");
            self.event_write(processor, key);
        }
    }

    /// Flush the write buffer, then give the processor its write callback.
    ///
    /// On `Retry` the connection is left registered for write readiness
    /// only. The caller decides whether `Complete` restores read interest.
    fn event_write<P: Processor>(&mut self, processor: &mut P, key: usize) -> Flush {
        let status = self.conns[key].flush();
        if status == Flush::Retry {
            trace!(token = key, "write would block, waiting for writability");
            self.register(key, Interest::WRITABLE);
        }

        let conn = &mut self.conns[key];
        let (rbuf, wbuf, data) = conn.parts();
        if let Err(e) = processor.write(rbuf, wbuf, data) {
            debug!(token = key, reason = %e, "processor signals connection termination");
            conn.set_state(ConnState::Terminating);
            return Flush::Error;
        }

        status
    }

    /// Replace the connection's interest; failure to do so ends it.
    fn register(&mut self, key: usize, interest: Interest) {
        let Some(base) = self.event_base.as_mut() else {
            return;
        };
        let conn = &mut self.conns[key];

        let result = if interest == Interest::WRITABLE {
            base.add_write(conn.write_id(), Token(key))
        } else {
            base.add_read(conn.read_id(), Token(key))
        };
        if let Err(e) = result {
            warn!(token = key, error = %e, "could not update event interest");
            conn.set_state(ConnState::Error);
        }
    }

    /// Take in as many connections as the acceptor has signalled.
    pub fn add_pending_streams<P: Processor>(&mut self, processor: &mut P) -> Drain {
        let Some(base) = self.event_base.as_mut() else {
            return Drain::default();
        };
        let worker = self.id;
        let conns = &mut self.conns;
        let metrics = &self.metrics;
        let mut rejected = Vec::new();

        let result = self.new_conn.drain(|mut conn| {
            let entry = conns.vacant_entry();
            let key = entry.key();
            conn.set_owner(Owner::Worker { id: worker, token: key });

            match base.add_read(conn.read_id(), Token(key)) {
                Ok(()) => {
                    trace!(worker, token = key, "adding new connection");
                    WorkerMetrics::incr(&metrics.add_stream);
                    entry.insert(conn);
                }
                Err(e) => {
                    warn!(worker, error = %e, "could not register new connection");
                    conn.set_state(ConnState::Error);
                    rejected.push(conn);
                }
            }
        });

        for conn in rejected {
            self.ret_stream(processor, conn);
        }

        match result {
            Ok(drain) => {
                if drain.missing() > 0 {
                    warn!(
                        worker,
                        missing = drain.missing(),
                        "event number does not match connection queue"
                    );
                }
                drain
            }
            Err(e) => {
                warn!(worker, error = %e, "not adding new connections due to pipe error");
                Drain::default()
            }
        }
    }

    /// Hand a finished connection back to the acceptor.
    fn ret_stream<P: Processor>(&mut self, processor: &mut P, mut conn: Box<BufSock>) {
        debug!(worker = self.id, conn = ?conn, "returning connection");

        // release what only the worker understands, then stop event updates
        let (rbuf, wbuf, data) = conn.parts();
        processor.error(rbuf, wbuf, data);
        if let Some(base) = self.event_base.as_mut() {
            let (rid, wid) = (conn.read_id(), conn.write_id());
            for id in [rid, wid] {
                if let Err(e) = base.del(id) {
                    warn!(worker = self.id, error = %e, "could not deregister connection");
                }
            }
        }

        WorkerMetrics::incr(&self.metrics.ret_stream);
        conn.set_owner(Owner::Acceptor);
        match self.term_conn.push(conn) {
            Ok(Signal::Sent) => {}
            Ok(Signal::Pending) => self.await_pipe_writable(),
            Err(PushError::Full(mut conn)) => {
                // nobody else can clean this up, so do it here
                error!(worker = self.id, "terminated connection queue is full");
                conn.close();
                conn.reset();
            }
            Err(PushError::Notify(e)) => {
                error!(worker = self.id, error = %e, "could not write to notification pipe");
            }
        }
    }

    /// Retry owed signal bytes on the terminated-connection pipe.
    fn pipe_write(&mut self) {
        match self.term_conn.flush_signals() {
            Ok(Signal::Sent) => {
                if let Some(base) = self.event_base.as_mut() {
                    if let Err(e) = base.del(self.term_conn.notify_id()) {
                        warn!(worker = self.id, error = %e, "could not clear pipe retry");
                    }
                }
            }
            Ok(Signal::Pending) => self.await_pipe_writable(),
            Err(e) => {
                error!(worker = self.id, error = %e, "could not write to notification pipe");
                if let Some(base) = self.event_base.as_mut() {
                    if let Err(e) = base.del(self.term_conn.notify_id()) {
                        warn!(worker = self.id, error = %e, "could not clear pipe retry");
                    }
                }
            }
        }
    }

    fn await_pipe_writable(&mut self) {
        trace!(worker = self.id, "retry send on notification pipe");
        if let Some(base) = self.event_base.as_mut() {
            if let Err(e) = base.add_write(self.term_conn.notify_id(), TERM_NOTIFY_TOKEN) {
                error!(worker = self.id, error = %e, "could not register pipe for retry");
            }
        }
    }

    /// Clock refreshed once per wait cycle, for sharing with processors.
    pub fn clock(&self) -> Arc<CoarseClock> {
        Arc::clone(&self.clock)
    }
}

#[cfg(test)]
impl Worker {
    fn len(&self) -> usize {
        self.conns.len()
    }

    fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn connection(&self, key: usize) -> Option<&BufSock> {
        self.conns.get(key).map(|conn| &**conn)
    }

    fn interest(&self, key: usize) -> Option<Interest> {
        let conn = self.conns.get(key)?;
        self.event_base.as_ref()?.interest(conn.read_id())
    }

    fn pipe_interest(&self) -> Option<Interest> {
        self.event_base
            .as_ref()?
            .interest(self.term_conn.notify_id())
    }

    fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::tests::{scripted_sock, Script};
    use crate::runtime::handoff;
    use crate::runtime::processor::{ProcessError, StateSlot};
    use bytes::BytesMut;
    use std::thread;

    /// Echoes whatever was read and counts callbacks.
    #[derive(Default)]
    struct Counting {
        reads: usize,
        writes: usize,
        errors: usize,
        fail_read: bool,
        fail_write: bool,
    }

    impl Processor for Counting {
        fn read(
            &mut self,
            rbuf: &mut BytesMut,
            wbuf: &mut BytesMut,
            _state: &mut StateSlot,
        ) -> Result<(), ProcessError> {
            self.reads += 1;
            if self.fail_read {
                return Err(ProcessError::Invalid("scripted"));
            }
            let request = rbuf.split();
            wbuf.extend_from_slice(&request);
            Ok(())
        }

        fn write(
            &mut self,
            _rbuf: &mut BytesMut,
            _wbuf: &mut BytesMut,
            _state: &mut StateSlot,
        ) -> Result<(), ProcessError> {
            self.writes += 1;
            if self.fail_write {
                return Err(ProcessError::Quit);
            }
            Ok(())
        }

        fn error(&mut self, _rbuf: &mut BytesMut, _wbuf: &mut BytesMut, state: &mut StateSlot) {
            self.errors += 1;
            state.clear();
        }
    }

    struct Harness {
        worker: Worker,
        new_tx: HandoffSender<Box<BufSock>>,
        term_rx: HandoffReceiver<Box<BufSock>>,
        processor: Counting,
    }

    impl Harness {
        fn new(queue_capacity: usize) -> Self {
            let (new_tx, new_rx) = handoff::channel(queue_capacity).unwrap();
            let (term_tx, term_rx) = handoff::channel(queue_capacity).unwrap();
            let options = WorkerOptions {
                timeout: Duration::from_millis(50),
                nevent: 64,
            };
            let worker = Worker::setup(
                0,
                Some(&options),
                Arc::new(WorkerMetrics::new()),
                WorkerHandoff {
                    new_conn: new_rx,
                    term_conn: term_tx,
                },
            )
            .unwrap();

            Self {
                worker,
                new_tx,
                term_rx,
                processor: Counting::default(),
            }
        }

        /// Push `n` scripted connections from the acceptor side.
        fn push(&mut self, n: usize) -> Vec<Arc<Script>> {
            (0..n)
                .map(|_| {
                    let (sock, script) = scripted_sock(64);
                    assert_eq!(self.new_tx.push(sock).unwrap(), Signal::Sent);
                    script
                })
                .collect()
        }

        fn cycle(&mut self) -> usize {
            self.worker.poll_once(&mut self.processor).unwrap()
        }

        fn dispatch(&mut self, key: usize, ready: Ready) {
            self.worker.dispatch(&mut self.processor, Token(key), ready);
        }

        fn only_key(&self) -> usize {
            assert_eq!(self.worker.len(), 1);
            self.worker.conns.iter().next().map(|(key, _)| key).unwrap()
        }

        fn returned(&mut self) -> Vec<Box<BufSock>> {
            let mut conns = Vec::new();
            self.term_rx.drain(|conn| conns.push(conn)).unwrap();
            conns
        }
    }

    #[test]
    fn test_intake_registers_for_read() {
        let mut h = Harness::new(16);
        h.push(1);

        assert_eq!(h.cycle(), 1);

        let key = h.only_key();
        assert_eq!(h.worker.interest(key), Some(Interest::READABLE));
        assert_eq!(
            h.worker.connection(key).unwrap().owner(),
            Owner::Worker { id: 0, token: key }
        );
        assert_eq!(h.worker.metrics().snapshot().add_stream, 1);

        // nothing left to take in
        assert_eq!(h.worker.add_pending_streams(&mut h.processor), Drain::default());
        assert_eq!(h.worker.len(), 1);
    }

    #[test]
    fn test_intake_conserves_count_across_cycles() {
        let mut h = Harness::new(16);
        let mut pushed = 0;

        for batch in [3, 0, 2, 5, 1] {
            h.push(batch);
            pushed += batch;
            h.cycle();
            assert_eq!(h.worker.len(), pushed);
        }

        let stats = h.worker.metrics().snapshot();
        assert_eq!(stats.add_stream, pushed as u64);
        assert_eq!(h.processor.reads, 0);
    }

    #[test]
    fn test_intake_shortfall_is_not_fatal() {
        let mut h = Harness::new(16);
        h.push(2);
        h.new_tx.owe_signal();
        assert_eq!(h.new_tx.flush_signals().unwrap(), Signal::Sent);

        let drain = h.worker.add_pending_streams(&mut h.processor);
        assert_eq!(drain.signaled, 3);
        assert_eq!(drain.received, 2);
        assert_eq!(h.worker.len(), 2);

        // the loop keeps going
        h.push(1);
        h.cycle();
        assert_eq!(h.worker.len(), 3);
    }

    #[test]
    fn test_read_processes_and_writes_back() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();

        scripts[0].push_inbound(b"PING\r\n");
        h.dispatch(key, Ready::READABLE);

        assert_eq!(scripts[0].sent(), b"PING\r\n");
        assert_eq!(h.processor.reads, 1);
        assert_eq!(h.processor.writes, 1);
        assert_eq!(h.worker.interest(key), Some(Interest::READABLE));
    }

    #[test]
    fn test_backpressure_switches_to_write_only() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();
        let script = &scripts[0];

        script.send_budget.store(4, Ordering::SeqCst);
        script.push_inbound(b"hello world");
        h.dispatch(key, Ready::READABLE);
        assert_eq!(h.worker.interest(key), Some(Interest::WRITABLE));
        assert_eq!(script.sent(), b"hell");

        // still blocked: stay write-only, processor.write runs every time
        h.dispatch(key, Ready::WRITABLE);
        assert_eq!(h.worker.interest(key), Some(Interest::WRITABLE));
        assert_eq!(h.processor.writes, 2);

        script.allow_send(3);
        h.dispatch(key, Ready::WRITABLE);
        assert_eq!(h.worker.interest(key), Some(Interest::WRITABLE));

        script.allow_send(1024);
        h.dispatch(key, Ready::WRITABLE);
        assert_eq!(h.worker.interest(key), Some(Interest::READABLE));
        assert_eq!(script.sent(), b"hello world");
        assert_eq!(h.processor.writes, 4);
        assert!(h.worker.connection(key).unwrap().is_active());
    }

    #[test]
    fn test_processor_termination_returns_connection_once() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();

        h.processor.fail_read = true;
        scripts[0].push_inbound(b"garbage");
        h.dispatch(key, Ready::READABLE | Ready::WRITABLE);

        assert_eq!(h.processor.reads, 1);
        assert_eq!(h.processor.writes, 0);
        assert_eq!(h.processor.errors, 1);
        assert!(h.worker.is_empty());

        let returned = h.returned();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].state(), ConnState::Terminating);
        assert_eq!(returned[0].owner(), Owner::Acceptor);
        let fd = returned[0].read_id();
        assert_eq!(h.worker.event_base.as_ref().unwrap().interest(fd), None);

        // late events for the old token are ignored
        scripts[0].push_inbound(b"more");
        h.dispatch(key, Ready::READABLE | Ready::WRITABLE);
        assert_eq!(h.processor.reads, 1);
        assert_eq!(h.processor.writes, 0);
        assert_eq!(h.worker.metrics().snapshot().ret_stream, 1);
    }

    #[test]
    fn test_processor_write_failure_terminates() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();

        h.processor.fail_write = true;
        scripts[0].push_inbound(b"QUIT\r\n");
        h.dispatch(key, Ready::READABLE);

        assert!(h.worker.is_empty());
        assert_eq!(h.returned()[0].state(), ConnState::Terminating);
    }

    #[test]
    fn test_peer_close_and_error_event() {
        let mut h = Harness::new(16);
        let scripts = h.push(2);
        h.cycle();
        let keys: Vec<usize> = h.worker.conns.iter().map(|(key, _)| key).collect();

        scripts[0].push_eof();
        h.dispatch(keys[0], Ready::READABLE);
        h.dispatch(keys[1], Ready::ERROR);

        assert!(h.worker.is_empty());
        let states: Vec<ConnState> = h.returned().iter().map(|conn| conn.state()).collect();
        assert_eq!(states, vec![ConnState::Terminating, ConnState::Error]);

        let stats = h.worker.metrics().snapshot();
        assert_eq!(stats.event_error, 1);
        assert_eq!(stats.ret_stream, 2);
    }

    #[test]
    fn test_hard_write_error_returns_connection() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();

        scripts[0].send_fails.store(true, Ordering::SeqCst);
        scripts[0].push_inbound(b"PING\r\n");
        h.dispatch(key, Ready::READABLE);

        assert!(h.worker.is_empty());
        assert_eq!(h.returned()[0].state(), ConnState::Error);
    }

    #[test]
    fn test_full_term_queue_closes_directly() {
        let mut h = Harness::new(1);
        let first = h.push(1);
        h.cycle();
        let second = h.push(1);
        h.cycle();
        assert_eq!(h.worker.len(), 2);

        let keys: Vec<usize> = h.worker.conns.iter().map(|(key, _)| key).collect();
        h.dispatch(keys[0], Ready::ERROR);
        h.dispatch(keys[1], Ready::ERROR);

        assert!(h.worker.is_empty());
        assert_eq!(h.processor.errors, 2);
        assert!(!first[0].is_closed());
        assert!(second[0].is_closed());

        let returned = h.returned();
        assert_eq!(returned.len(), 1);
    }

    #[test]
    fn test_pipe_retry_clears_registration() {
        let mut h = Harness::new(4);
        h.worker.term_conn.owe_signal();
        h.worker.await_pipe_writable();

        assert_eq!(h.worker.pipe_interest(), Some(Interest::WRITABLE));

        h.worker
            .dispatch(&mut h.processor, TERM_NOTIFY_TOKEN, Ready::WRITABLE);
        assert_eq!(h.worker.pipe_interest(), None);
        assert_eq!(h.worker.term_conn.pending(), 0);

        let drain = h.term_rx.drain(drop).unwrap();
        assert_eq!(drain.signaled, 1);
        assert_eq!(drain.missing(), 1);
    }

    #[test]
    fn test_return_waits_for_full_pipe() {
        let mut h = Harness::new(16);
        h.push(1);
        h.cycle();
        let key = h.only_key();

        // fill the pipe with signals for items that are not there
        loop {
            h.worker.term_conn.owe_signal();
            if h.worker.term_conn.flush_signals().unwrap() == Signal::Pending {
                break;
            }
        }

        h.dispatch(key, Ready::ERROR);
        assert!(h.worker.is_empty());
        assert_eq!(h.worker.term_conn.pending(), 2);
        assert_eq!(h.worker.pipe_interest(), Some(Interest::WRITABLE));

        // still full: stay registered
        h.worker
            .dispatch(&mut h.processor, TERM_NOTIFY_TOKEN, Ready::WRITABLE);
        assert_eq!(h.worker.pipe_interest(), Some(Interest::WRITABLE));
        assert_eq!(h.worker.term_conn.pending(), 2);

        let mut returned = 0;
        loop {
            let drain = h.term_rx.drain(|_| returned += 1).unwrap();
            if drain.signaled == 0 {
                break;
            }
        }
        assert_eq!(returned, 1);

        h.worker
            .dispatch(&mut h.processor, TERM_NOTIFY_TOKEN, Ready::WRITABLE);
        assert_eq!(h.worker.pipe_interest(), None);
        assert_eq!(h.worker.term_conn.pending(), 0);
        assert_eq!(h.term_rx.drain(drop).unwrap().signaled, 2);
    }

    #[test]
    fn test_pipe_hard_failure_drops_retry() {
        let Harness {
            mut worker,
            new_tx: _new_tx,
            term_rx,
            mut processor,
        } = Harness::new(4);
        drop(term_rx);

        worker.term_conn.owe_signal();
        worker.await_pipe_writable();
        assert_eq!(worker.pipe_interest(), Some(Interest::WRITABLE));

        worker.dispatch(&mut processor, TERM_NOTIFY_TOKEN, Ready::WRITABLE);
        assert_eq!(worker.pipe_interest(), None);
        assert_eq!(worker.term_conn.pending(), 1);

        // the loop keeps going
        assert_eq!(worker.poll_once(&mut processor).unwrap(), 0);
    }

    #[test]
    fn test_recv_error_skips_processor() {
        let mut h = Harness::new(16);
        let scripts = h.push(1);
        h.cycle();
        let key = h.only_key();

        scripts[0]
            .inbound
            .lock()
            .unwrap()
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));
        h.dispatch(key, Ready::READABLE);

        assert_eq!(h.processor.reads, 0);
        assert_eq!(h.processor.errors, 1);
        assert_eq!(h.returned()[0].state(), ConnState::Error);
    }

    #[test]
    fn test_pipe_error_event_changes_nothing() {
        let mut h = Harness::new(4);
        h.push(1);
        h.cycle();

        h.worker
            .dispatch(&mut h.processor, NEW_CONN_TOKEN, Ready::ERROR);
        assert_eq!(h.worker.len(), 1);
        assert_eq!(h.worker.metrics().snapshot().event_error, 1);
    }

    #[test]
    fn test_teardown_twice_and_run_after() {
        let mut h = Harness::new(4);
        h.push(1);
        h.cycle();
        let scripts_closed = h.worker.len();
        assert_eq!(scripts_closed, 1);

        h.worker.teardown();
        assert!(h.worker.is_empty());
        h.worker.teardown();

        let err = h.worker.poll_once(&mut h.processor).unwrap_err();
        assert!(matches!(err, WorkerError::NotSetUp));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_run_stops_when_flag_clears() {
        let mut h = Harness::new(4);
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(120));
            flag.store(false, Ordering::Release);
        });

        h.worker.run(&mut h.processor, &running).unwrap();
        stopper.join().unwrap();

        let stats = h.worker.metrics().snapshot();
        assert!(stats.event_loop >= 2);
        assert_eq!(stats.event_total, 0);
    }

    #[test]
    fn test_clock_refreshed_per_cycle() {
        let mut h = Harness::new(4);
        let clock = h.worker.clock();
        let before = clock.now_millis();

        thread::sleep(Duration::from_millis(20));
        h.cycle();
        assert!(clock.now_millis() >= before + 20);
    }

    #[test]
    fn test_error_exit_codes() {
        let err = WorkerError::EventBase(io::Error::new(io::ErrorKind::Other, "no epoll"));
        assert_eq!(err.exit_code(), 78);
        assert_eq!(err.to_string(), "could not create event base: no epoll");

        let err = WorkerError::Wait(io::Error::new(io::ErrorKind::Other, "EBADF"));
        assert_eq!(err.exit_code(), 1);
    }
}
