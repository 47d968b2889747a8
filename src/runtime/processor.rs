//! Protocol processor contract.
//!
//! The worker never interprets bytes. On readiness it hands the
//! connection's read buffer, write buffer and per-connection state to a
//! `Processor`, which consumes requests and appends responses.

use bytes::BytesMut;
use std::any::Any;

/// Why a processor asked for its connection to be terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Client asked to close the session.
    Quit,
    /// Input could not be parsed; the stream cannot be resynchronized.
    Invalid(&'static str),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Quit => write!(f, "client quit"),
            ProcessError::Invalid(reason) => write!(f, "invalid request: {reason}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Opaque per-connection slot owned by the processor.
///
/// The connection only carries it around; the processor decides what
/// lives here and releases it from `Processor::error`.
#[derive(Default)]
pub struct StateSlot(Option<Box<dyn Any + Send>>);

impl StateSlot {
    pub fn new() -> Self {
        Self(None)
    }

    /// Borrow the state as `T`, creating it with `init` when the slot is
    /// empty or holds some other type.
    pub fn get_or_insert_with<T, F>(&mut self, init: F) -> &mut T
    where
        T: Any + Send,
        F: FnOnce() -> T,
    {
        if !self.0.as_ref().is_some_and(|state| state.is::<T>()) {
            self.0 = Some(Box::new(init()));
        }
        match self.0.as_mut().and_then(|state| state.downcast_mut::<T>()) {
            Some(state) => state,
            None => unreachable!("slot was just filled with this type"),
        }
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|state| state.downcast_mut::<T>())
    }

    /// Drop whatever the processor stored.
    pub fn clear(&mut self) {
        self.0 = None;
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl std::fmt::Debug for StateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StateSlot")
            .field(&if self.0.is_some() { "set" } else { "empty" })
            .finish()
    }
}

/// Request/response logic driven by the worker.
///
/// `read` and `write` returning `Err` terminates the connection. Buffer
/// consumption is entirely up to the implementation.
pub trait Processor {
    /// Called after new bytes were read into `rbuf`.
    fn read(
        &mut self,
        rbuf: &mut BytesMut,
        wbuf: &mut BytesMut,
        state: &mut StateSlot,
    ) -> Result<(), ProcessError>;

    /// Called once per write attempt, whatever the flush outcome.
    fn write(
        &mut self,
        rbuf: &mut BytesMut,
        wbuf: &mut BytesMut,
        state: &mut StateSlot,
    ) -> Result<(), ProcessError>;

    /// Called once when the connection leaves the worker.
    fn error(&mut self, rbuf: &mut BytesMut, wbuf: &mut BytesMut, state: &mut StateSlot);
}
