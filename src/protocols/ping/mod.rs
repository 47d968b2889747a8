//! Ping protocol.
//!
//! A minimal protocol for health checks and latency measurement. It
//! exercises only the runtime: no state survives between requests.
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! (connection closed)
//! ```
//!
//! Unknown commands get `ERROR unknown command\r\n` and the session
//! continues. A line longer than `MAX_LINE` without a terminator ends it.

mod parser;
mod processor;

pub use processor::PingProcessor;
