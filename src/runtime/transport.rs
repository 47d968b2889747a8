//! Byte-stream endpoints and the capabilities each thread role holds.
//!
//! A connection carries a `Transport`, the stream half of the capability
//! table: receive, send, close and the two event ids used for readiness
//! registration. Listening operations (accept/reject/open) belong to the
//! `Listener` trait, which only the acceptor holds. The worker never sees
//! a `Listener`, so it cannot perform those operations.

use mio::net::{TcpListener, TcpStream};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

/// Stream operations available to whichever thread owns a connection.
pub trait Transport: Send {
    /// Non-blocking receive. `Ok(0)` means the peer closed the stream.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking send. May accept fewer bytes than offered.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shut the stream down in both directions.
    fn close(&mut self);

    /// Event id registered for read readiness.
    fn read_id(&self) -> RawFd;

    /// Event id registered for write readiness.
    fn write_id(&self) -> RawFd;
}

/// Acceptor-only operations over a listening endpoint.
pub trait Listener {
    type Stream: Transport + 'static;

    /// Accept one pending stream, `WouldBlock` when none is queued.
    fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Accept and immediately drop one pending stream.
    fn reject(&mut self) -> io::Result<()> {
        let (mut stream, _) = self.accept()?;
        stream.close();
        Ok(())
    }

    /// Event id registered for incoming connections.
    fn open_id(&self) -> RawFd;
}

/// TCP transport over a mio stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    closed: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            // NotConnected after a peer reset is expected here
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn read_id(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn write_id(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// TCP listener producing `TcpTransport`s with Nagle disabled.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind a non-blocking listener with SO_REUSEADDR.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener: std::net::TcpListener = socket.into();
        Ok(Self {
            listener: TcpListener::from_std(listener),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpAcceptor {
    type Stream = TcpTransport;

    fn accept(&mut self) -> io::Result<(TcpTransport, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nodelay(true)?;
        Ok((TcpTransport::new(stream), peer))
    }

    fn open_id(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}
