use super::parser::{self, Command, ParseResult};
use crate::runtime::clock::CoarseClock;
use crate::runtime::processor::{ProcessError, Processor, StateSlot};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-connection echo state kept between reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EchoState {
    /// Length from a header whose payload is not fully buffered yet.
    pending: Option<usize>,
    /// Coarse time of the first read, in milliseconds.
    started: i64,
    echoed: u64,
}

/// Echoes every complete `<length>\r\n<data>` frame.
#[derive(Debug)]
pub struct EchoProcessor {
    clock: Arc<CoarseClock>,
    echoed: u64,
}

impl EchoProcessor {
    pub fn new(clock: Arc<CoarseClock>) -> Self {
        Self { clock, echoed: 0 }
    }
}

impl Processor for EchoProcessor {
    fn read(
        &mut self,
        rbuf: &mut BytesMut,
        wbuf: &mut BytesMut,
        state: &mut StateSlot,
    ) -> Result<(), ProcessError> {
        let clock = &self.clock;
        let state = state.get_or_insert_with(|| EchoState {
            pending: None,
            started: clock.now_millis(),
            echoed: 0,
        });

        loop {
            let length = match state.pending {
                Some(length) => length,
                None => match parser::parse(rbuf) {
                    ParseResult::Complete(Command::Echo { length, header_len }) => {
                        rbuf.advance(header_len);
                        state.pending = Some(length);
                        length
                    }
                    ParseResult::Complete(Command::Quit) => return Err(ProcessError::Quit),
                    ParseResult::Incomplete => return Ok(()),
                    ParseResult::InvalidLength => {
                        return Err(ProcessError::Invalid("bad length"));
                    }
                    ParseResult::TooLarge(length) => {
                        debug!(length, "echo payload too large");
                        return Err(ProcessError::Invalid("payload too large"));
                    }
                },
            };

            if rbuf.len() < length {
                trace!(have = rbuf.len(), want = length, "waiting for payload");
                return Ok(());
            }

            let header = format!("{length}\r\n");
            wbuf.reserve(header.len() + length);
            wbuf.put_slice(header.as_bytes());
            wbuf.put_slice(&rbuf[..length]);
            rbuf.advance(length);

            state.pending = None;
            state.echoed += length as u64;
            self.echoed += length as u64;
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
        if let Some(session) = state.get_mut::<EchoState>() {
            if let Some(length) = session.pending {
                debug!(length, buffered = rbuf.len(), "echo session ended mid-payload");
            }
            debug!(
                duration_ms = self.clock.now_millis() - session.started,
                echoed = session.echoed,
                total_echoed = self.echoed,
                "echo session ended"
            );
        }
        rbuf.clear();
        wbuf.clear();
        state.clear();
    }
}
