//! Buffered connection handed between the acceptor and the worker.
//!
//! A `BufSock` pairs a transport with its read and write buffers and the
//! processor's state slot. It is owned by exactly one thread at a time:
//! the acceptor until it is pushed on the new-connection queue, the worker
//! from intake until it is pushed on the terminated-connection queue.

use crate::runtime::processor::StateSlot;
use crate::runtime::transport::Transport;
use bytes::{Buf, BytesMut};
use std::io;
use tracing::trace;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Normal operation.
    Active,
    /// Peer or processor asked to close.
    Terminating,
    /// Transport failure or error event from the multiplexer.
    Error,
}

/// Thread role currently holding the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Created by the acceptor, not yet taken by a worker.
    Acceptor,
    /// Taken in by a worker; `token` is its registration key there.
    Worker { id: usize, token: usize },
}

/// Outcome of draining the write buffer into the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Write buffer is empty.
    Complete,
    /// Transport would block with data still buffered.
    Retry,
    /// Transport failed; the connection is in `ConnState::Error`.
    Error,
}

/// A transport plus the buffers the processor works on.
pub struct BufSock {
    transport: Box<dyn Transport>,
    pub(crate) rbuf: BytesMut,
    pub(crate) wbuf: BytesMut,
    pub(crate) data: StateSlot,
    state: ConnState,
    owner: Owner,
    chunk: usize,
}

impl BufSock {
    /// Wrap a freshly accepted transport. `buf_size` is the initial
    /// capacity of each buffer and the read chunk size.
    pub fn new(transport: Box<dyn Transport>, buf_size: usize) -> Self {
        Self {
            transport,
            rbuf: BytesMut::with_capacity(buf_size),
            wbuf: BytesMut::with_capacity(buf_size),
            data: StateSlot::new(),
            state: ConnState::Active,
            owner: Owner::Acceptor,
            chunk: buf_size.max(1),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnState::Active
    }

    /// True once the connection must leave the worker.
    pub fn is_closing(&self) -> bool {
        matches!(self.state, ConnState::Terminating | ConnState::Error)
    }

    #[cfg(test)]
    pub(crate) fn owner(&self) -> Owner {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Owner) {
        self.owner = owner;
    }

    pub fn read_id(&self) -> std::os::unix::io::RawFd {
        self.transport.read_id()
    }

    pub fn write_id(&self) -> std::os::unix::io::RawFd {
        self.transport.write_id()
    }

    #[cfg(test)]
    fn rbuf(&self) -> &BytesMut {
        &self.rbuf
    }

    pub fn wbuf(&self) -> &BytesMut {
        &self.wbuf
    }

    #[cfg(test)]
    fn wbuf_mut(&mut self) -> &mut BytesMut {
        &mut self.wbuf
    }

    /// Split borrow for processor calls.
    pub(crate) fn parts(&mut self) -> (&mut BytesMut, &mut BytesMut, &mut StateSlot) {
        (&mut self.rbuf, &mut self.wbuf, &mut self.data)
    }

    /// Read from the transport until it would block.
    ///
    /// EOF moves the connection to `Terminating`, a hard error to `Error`.
    /// Returns the number of bytes appended to the read buffer.
    pub fn fill(&mut self) -> usize {
        let mut total = 0;

        loop {
            let filled = self.rbuf.len();
            self.rbuf.resize(filled + self.chunk, 0);

            match self.transport.recv(&mut self.rbuf[filled..]) {
                Ok(0) => {
                    self.rbuf.truncate(filled);
                    trace!(total, "peer closed stream");
                    self.state = ConnState::Terminating;
                    break;
                }
                Ok(n) => {
                    self.rbuf.truncate(filled + n);
                    total += n;
                }
                Err(e) => {
                    self.rbuf.truncate(filled);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            trace!(error = %e, "recv failed");
                            self.state = ConnState::Error;
                            break;
                        }
                    }
                }
            }
        }

        total
    }

    /// Write buffered data to the transport until it empties or would block.
    pub fn flush(&mut self) -> Flush {
        while !self.wbuf.is_empty() {
            match self.transport.send(&self.wbuf) {
                Ok(0) => return Flush::Retry,
                Ok(n) => self.wbuf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Flush::Retry,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(error = %e, "send failed");
                    self.state = ConnState::Error;
                    return Flush::Error;
                }
            }
        }

        Flush::Complete
    }

    /// Close the transport directly, bypassing the acceptor.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Drop buffered bytes and processor state, keeping allocations.
    pub fn reset(&mut self) {
        self.rbuf.clear();
        self.wbuf.clear();
        self.data.clear();
        self.state = ConnState::Active;
        self.owner = Owner::Acceptor;
    }
}

impl std::fmt::Debug for BufSock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufSock")
            .field("fd", &self.transport.read_id())
            .field("state", &self.state)
            .field("owner", &self.owner)
            .field("rbuf", &self.rbuf.len())
            .field("wbuf", &self.wbuf.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Observable side of a `ScriptedTransport`.
    #[derive(Default)]
    pub(crate) struct Script {
        /// Chunks returned by successive `recv` calls.
        pub inbound: Mutex<VecDeque<io::Result<Vec<u8>>>>,
        /// Everything accepted by `send`.
        pub sent: Mutex<Vec<u8>>,
        /// Bytes `send` will still accept before reporting `WouldBlock`.
        pub send_budget: AtomicUsize,
        /// Make the next `send` fail hard.
        pub send_fails: AtomicBool,
        pub closed: AtomicBool,
    }

    impl Script {
        pub fn push_inbound(&self, bytes: &[u8]) {
            self.inbound.lock().unwrap().push_back(Ok(bytes.to_vec()));
        }

        pub fn push_eof(&self) {
            self.inbound.lock().unwrap().push_back(Ok(Vec::new()));
        }

        pub fn allow_send(&self, bytes: usize) {
            self.send_budget.fetch_add(bytes, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<u8> {
            self.sent.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Transport with scripted I/O outcomes.
    ///
    /// A real socket backs the event ids so registration with the
    /// multiplexer behaves normally.
    pub(crate) struct ScriptedTransport {
        script: Arc<Script>,
        fd_holder: UnixStream,
        _peer: UnixStream,
    }

    impl ScriptedTransport {
        pub fn new() -> (Self, Arc<Script>) {
            let (fd_holder, peer) = UnixStream::pair().unwrap();
            let script = Arc::new(Script {
                send_budget: AtomicUsize::new(usize::MAX / 2),
                ..Default::default()
            });
            (
                Self {
                    script: Arc::clone(&script),
                    fd_holder,
                    _peer: peer,
                },
                script,
            )
        }
    }

    impl Transport for ScriptedTransport {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.script.inbound.lock().unwrap();
            match inbound.pop_front() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(Err(e)) => Err(e),
                Some(Ok(mut chunk)) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        inbound.push_front(Ok(chunk.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }

        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.script.send_fails.load(Ordering::SeqCst) {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let budget = self.script.send_budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = budget.min(buf.len());
            self.script.send_budget.fetch_sub(n, Ordering::SeqCst);
            self.script.sent.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) {
            self.script.closed.store(true, Ordering::SeqCst);
        }

        fn read_id(&self) -> RawFd {
            self.fd_holder.as_raw_fd()
        }

        fn write_id(&self) -> RawFd {
            self.fd_holder.as_raw_fd()
        }
    }

    pub(crate) fn scripted_sock(buf_size: usize) -> (Box<BufSock>, Arc<Script>) {
        let (transport, script) = ScriptedTransport::new();
        (Box::new(BufSock::new(Box::new(transport), buf_size)), script)
    }

    #[test]
    fn test_fill_reads_until_would_block() {
        let (mut sock, script) = scripted_sock(4);
        script.push_inbound(b"hello ");
        script.push_inbound(b"world");

        assert_eq!(sock.fill(), 11);
        assert_eq!(&sock.rbuf()[..], b"hello world");
        assert!(sock.is_active());
    }

    #[test]
    fn test_fill_eof_terminates() {
        let (mut sock, script) = scripted_sock(16);
        script.push_inbound(b"QUIT\r\n");
        script.push_eof();

        assert_eq!(sock.fill(), 6);
        assert_eq!(sock.state(), ConnState::Terminating);
        assert!(sock.is_closing());
    }

    #[test]
    fn test_fill_hard_error() {
        let (mut sock, script) = scripted_sock(16);
        script
            .inbound
            .lock()
            .unwrap()
            .push_back(Err(io::ErrorKind::ConnectionReset.into()));

        assert_eq!(sock.fill(), 0);
        assert_eq!(sock.state(), ConnState::Error);
        assert!(sock.rbuf().is_empty());
    }

    #[test]
    fn test_flush_partial_then_complete() {
        let (mut sock, script) = scripted_sock(16);
        script.send_budget.store(3, Ordering::SeqCst);
        sock.wbuf_mut().extend_from_slice(b"PONG\r\n");

        assert_eq!(sock.flush(), Flush::Retry);
        assert_eq!(&sock.wbuf()[..], b"G\r\n");

        script.allow_send(16);
        assert_eq!(sock.flush(), Flush::Complete);
        assert_eq!(script.sent(), b"PONG\r\n");
        assert!(sock.wbuf().is_empty());
    }

    #[test]
    fn test_flush_error_marks_connection() {
        let (mut sock, script) = scripted_sock(16);
        script.send_fails.store(true, Ordering::SeqCst);
        sock.wbuf_mut().extend_from_slice(b"data");

        assert_eq!(sock.flush(), Flush::Error);
        assert_eq!(sock.state(), ConnState::Error);
    }

    #[test]
    fn test_reset_and_close() {
        let (mut sock, script) = scripted_sock(16);
        sock.wbuf_mut().extend_from_slice(b"pending");
        sock.set_state(ConnState::Error);
        sock.set_owner(Owner::Worker { id: 0, token: 3 });

        sock.close();
        sock.reset();
        assert!(script.is_closed());
        assert!(sock.wbuf().is_empty());
        assert!(sock.is_active());
        assert_eq!(sock.owner(), Owner::Acceptor);
    }
}
