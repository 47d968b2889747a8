//! Echo protocol.
//!
//! A length-prefixed echo service for throughput testing. Payloads may
//! arrive over many reads; the parsed header waits in the connection's
//! state slot until the whole payload is buffered.
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` in place of a header closes the connection.

mod parser;
mod processor;

pub use processor::EchoProcessor;
