//! Echo protocol parser.

/// Largest payload accepted.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Longest header line, terminator excluded.
const MAX_HEADER: usize = 32;

/// Parsed echo header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Payload of `length` bytes follows the header.
    Echo {
        /// Length of data to echo.
        length: usize,
        /// Bytes consumed by the header (length + \r\n).
        header_len: usize,
    },
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// Successfully parsed header.
    Complete(Command),
    /// Need more data for the header.
    Incomplete,
    /// Header is not a decimal length.
    InvalidLength,
    /// Length is above `MAX_PAYLOAD`.
    TooLarge(usize),
}

/// Parse an echo header from the front of `input`.
///
/// For `Echo`, the payload may not be buffered yet; the caller waits for
/// `header_len + length` bytes.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER + 1 => return ParseResult::InvalidLength,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];

    if line.eq_ignore_ascii_case(b"QUIT") {
        return ParseResult::Complete(Command::Quit);
    }

    let length: usize = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };
    if length > MAX_PAYLOAD {
        return ParseResult::TooLarge(length);
    }

    ParseResult::Complete(Command::Echo {
        length,
        header_len: line_end + 2,
    })
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}
