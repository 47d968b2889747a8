use super::parser::{self, Command, ParseResult};
use crate::runtime::clock::CoarseClock;
use crate::runtime::processor::{ProcessError, Processor, StateSlot};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-connection ping state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PingSession {
    /// Coarse time of the first read, in milliseconds.
    started: i64,
    requests: u64,
}

/// Answers every complete `PING` line in the read buffer.
#[derive(Debug)]
pub struct PingProcessor {
    clock: Arc<CoarseClock>,
    requests: u64,
}

impl PingProcessor {
    pub fn new(clock: Arc<CoarseClock>) -> Self {
        Self { clock, requests: 0 }
    }
}

impl Processor for PingProcessor {
    fn read(
        &mut self,
        rbuf: &mut BytesMut,
        wbuf: &mut BytesMut,
        state: &mut StateSlot,
    ) -> Result<(), ProcessError> {
        let clock = &self.clock;
        let session = state.get_or_insert_with(|| PingSession {
            started: clock.now_millis(),
            requests: 0,
        });

        loop {
            match parser::parse(rbuf) {
                ParseResult::Complete(Command::Ping, consumed) => {
                    wbuf.put_slice(parser::PONG);
                    rbuf.advance(consumed);
                }
                ParseResult::Complete(Command::PingMsg(msg), consumed) => {
                    wbuf.reserve(msg.len() + 7);
                    wbuf.put_slice(b"PONG ");
                    wbuf.put_slice(msg);
                    wbuf.put_slice(b"\r\n");
                    rbuf.advance(consumed);
                }
                ParseResult::Complete(Command::Quit, consumed) => {
                    rbuf.advance(consumed);
                    return Err(ProcessError::Quit);
                }
                ParseResult::Unknown(consumed) => {
                    debug!(len = consumed, "unknown ping command");
                    wbuf.put_slice(parser::ERROR_UNKNOWN);
                    rbuf.advance(consumed);
                }
                ParseResult::TooLong => return Err(ProcessError::Invalid("line too long")),
                ParseResult::Incomplete => return Ok(()),
            }
            session.requests += 1;
            self.requests += 1;
        }
    }

    fn write(
        &mut self,
        _rbuf: &mut BytesMut,
        _wbuf: &mut BytesMut,
        _state: &mut StateSlot,
    ) -> Result<(), ProcessError> {
        Ok(())
    }

    fn error(&mut self, rbuf: &mut BytesMut, wbuf: &mut BytesMut, state: &mut StateSlot) {
        if let Some(session) = state.get_mut::<PingSession>() {
            debug!(
                duration_ms = self.clock.now_millis() - session.started,
                requests = session.requests,
                total_requests = self.requests,
                "ping session ended"
            );
        }
        trace!(unread = rbuf.len(), unsent = wbuf.len(), "released ping buffers");
        rbuf.clear();
        wbuf.clear();
        state.clear();
    }
}
