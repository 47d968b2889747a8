//! Readiness multiplexer with a registration table.
//!
//! Thin layer over `mio::Poll` keyed by raw event ids. It remembers the
//! interest currently registered for every id so callers can delete and
//! re-add interest without tracking it themselves.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness bits reported for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const READABLE: Ready = Ready(0b001);
    pub const WRITABLE: Ready = Ready(0b010);
    pub const ERROR: Ready = Ready(0b100);

    pub fn empty() -> Self {
        Ready(0)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    fn from_event(event: &mio::event::Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() || event.is_read_closed() {
            ready = ready | Ready::READABLE;
        }
        if event.is_writable() {
            ready = ready | Ready::WRITABLE;
        }
        if event.is_error() {
            ready = ready | Ready::ERROR;
        }
        ready
    }
}

impl std::ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

/// Registered interest for one event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    token: Token,
    interest: Interest,
}

/// A poller plus the table of what is registered on it.
pub struct EventBase {
    poll: Poll,
    events: Events,
    table: HashMap<RawFd, Registration>,
}

impl EventBase {
    /// Create a poller returning at most `nevent` events per wait.
    pub fn new(nevent: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(nevent.max(1)),
            table: HashMap::new(),
        })
    }

    /// Listen for read readiness on `id`, replacing any existing interest.
    pub fn add_read(&mut self, id: RawFd, token: Token) -> io::Result<()> {
        self.add(id, token, Interest::READABLE)
    }

    /// Listen for write readiness on `id`, replacing any existing interest.
    pub fn add_write(&mut self, id: RawFd, token: Token) -> io::Result<()> {
        self.add(id, token, Interest::WRITABLE)
    }

    fn add(&mut self, id: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        if self.table.contains_key(&id) {
            registry.reregister(&mut SourceFd(&id), token, interest)?;
        } else {
            registry.register(&mut SourceFd(&id), token, interest)?;
        }
        self.table.insert(id, Registration { token, interest });
        Ok(())
    }

    /// Remove all interest on `id`. Unknown ids are ignored.
    pub fn del(&mut self, id: RawFd) -> io::Result<()> {
        if self.table.remove(&id).is_some() {
            self.poll.registry().deregister(&mut SourceFd(&id))?;
        }
        Ok(())
    }

    /// Interest currently registered for `id`.
    #[cfg(test)]
    pub(crate) fn interest(&self, id: RawFd) -> Option<Interest> {
        self.table.get(&id).map(|reg| reg.interest)
    }

    /// Number of registered ids.
    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Block until a registered source is ready or `timeout` elapses.
    ///
    /// Ready sources are appended to `ready` (cleared first) in the order
    /// the poller reported them. Returns the number of events.
    pub fn wait(&mut self, timeout: Duration, ready: &mut Vec<(Token, Ready)>) -> io::Result<usize> {
        ready.clear();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        ready.extend(
            self.events
                .iter()
                .map(|event| (event.token(), Ready::from_event(event))),
        );
        Ok(ready.len())
    }
}
