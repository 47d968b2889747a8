//! Ping protocol parser.

/// Longest request line accepted, terminator excluded.
pub const MAX_LINE: usize = 1024;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult<'a> {
    /// Parsed command with bytes consumed.
    Complete(Command<'a>, usize),
    /// Need more data.
    Incomplete,
    /// Unrecognized line; skip the bytes consumed.
    Unknown(usize),
    /// No terminator within `MAX_LINE` bytes.
    TooLong,
}

/// Parse one ping command from the front of `input`.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_LINE + 1 => return ParseResult::TooLong,
        None => return ParseResult::Incomplete,
    };
    if line_end > MAX_LINE {
        return ParseResult::TooLong;
    }

    let line = &input[..line_end];
    let consumed = line_end + 2;

    if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(&line[5..]), consumed)
    } else {
        ParseResult::Unknown(consumed)
    }
}

pub const PONG: &[u8] = b"PONG\r\n";
pub const ERROR_UNKNOWN: &[u8] = b"ERROR unknown command\r\n";

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
