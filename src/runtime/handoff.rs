//! Cross-thread handoff of owned items.
//!
//! Each handoff is a bounded ring plus a pipe used purely as a counting
//! signal: every successful push eventually writes exactly one byte, and
//! the consumer pops at most one item per byte it reads. Ownership of an
//! item moves at the ring boundary; nothing else is shared.
//!
//! Both pipe ends are non-blocking and can be registered with a poller
//! through `notify_id`.

use crossbeam_queue::ArrayQueue;
use mio::unix::pipe;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use tracing::trace;

/// Bytes read from the notification pipe per `read` call.
pub const SCRATCH_SIZE: usize = 1024;

/// Create a handoff with room for `capacity` items.
pub fn channel<T: Send>(capacity: usize) -> io::Result<(HandoffSender<T>, HandoffReceiver<T>)> {
    let (tx, rx) = pipe::new()?;
    let ring = Arc::new(ArrayQueue::new(capacity.max(1)));

    Ok((
        HandoffSender {
            ring: Arc::clone(&ring),
            notify: tx,
            pending: 0,
        },
        HandoffReceiver { ring, notify: rx },
    ))
}

/// Result of signalling the consumer after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// All owed bytes are in the pipe.
    Sent,
    /// The pipe is full; call `flush_signals` once it is writable.
    Pending,
}

/// Error returned by `HandoffSender::push`.
#[derive(Debug)]
pub enum PushError<T> {
    /// Ring is at capacity; the item is handed back untouched.
    Full(T),
    /// Item was enqueued but the pipe failed; the signal stays owed.
    Notify(io::Error),
}

impl<T> std::fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "handoff queue is full"),
            PushError::Notify(e) => write!(f, "handoff notification failed: {e}"),
        }
    }
}

impl<T: std::fmt::Debug> std::error::Error for PushError<T> {}

/// Producer half.
pub struct HandoffSender<T> {
    ring: Arc<ArrayQueue<T>>,
    notify: pipe::Sender,
    /// Signal bytes owed for items already in the ring.
    pending: usize,
}

impl<T> HandoffSender<T> {
    /// Enqueue `item` and signal the consumer.
    pub fn push(&mut self, item: T) -> Result<Signal, PushError<T>> {
        self.ring.push(item).map_err(PushError::Full)?;
        self.pending += 1;
        self.flush_signals().map_err(PushError::Notify)
    }

    /// Write every owed signal byte the pipe will take.
    pub fn flush_signals(&mut self) -> io::Result<Signal> {
        const MARKS: [u8; 64] = [0u8; 64];

        while self.pending > 0 {
            let n = self.pending.min(MARKS.len());
            match self.notify.write(&MARKS[..n]) {
                Ok(0) => return Ok(Signal::Pending),
                Ok(written) => self.pending -= written,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    trace!(pending = self.pending, "notification pipe full");
                    return Ok(Signal::Pending);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Signal::Sent)
    }

    /// Owe a signal byte with no item behind it.
    #[cfg(test)]
    pub(crate) fn owe_signal(&mut self) {
        self.pending += 1;
    }

    /// Signal bytes not yet written.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Event id to register for write readiness when signals are owed.
    pub fn notify_id(&self) -> RawFd {
        self.notify.as_raw_fd()
    }
}

/// What one `drain` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Drain {
    /// Signal bytes read from the pipe.
    pub signaled: usize,
    /// Items popped and handed to the callback.
    pub received: usize,
}

impl Drain {
    /// Signals that had no matching item in the ring.
    pub fn missing(&self) -> usize {
        self.signaled - self.received
    }
}

/// Consumer half.
pub struct HandoffReceiver<T> {
    ring: Arc<ArrayQueue<T>>,
    notify: pipe::Receiver,
}

impl<T> HandoffReceiver<T> {
    /// Read signal bytes until the pipe is empty, popping one item per byte.
    ///
    /// Never pops more items than bytes read; extra items stay queued for
    /// the next wake. If the ring runs dry before the byte count is
    /// matched, draining stops and the shortfall shows in the returned
    /// `Drain`. The unmatched bytes are discarded.
    pub fn drain<F>(&mut self, mut f: F) -> io::Result<Drain>
    where
        F: FnMut(T),
    {
        let mut scratch = [0u8; SCRATCH_SIZE];
        let mut drain = Drain::default();

        loop {
            let n = match self.notify.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if drain.signaled > 0 {
                        break;
                    }
                    return Err(e);
                }
            };
            drain.signaled += n;

            for _ in 0..n {
                match self.ring.pop() {
                    Some(item) => {
                        drain.received += 1;
                        f(item);
                    }
                    None => return Ok(drain),
                }
            }
        }

        Ok(drain)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ring.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Event id to register for read readiness.
    pub fn notify_id(&self) -> RawFd {
        self.notify.as_raw_fd()
    }
}
