//! Protocol processors.
//!
//! Each protocol pairs a parser with a `Processor` the worker drives.
//!
//! - `ping`: ping/pong for health checks and latency measurement
//! - `echo`: length-prefixed echo for throughput testing

pub mod echo;
pub mod ping;
