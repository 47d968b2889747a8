//! Worker counters.
//!
//! Plain monotonic counters, incremented by the worker thread and
//! readable from anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by one worker.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    /// Completed wait cycles.
    pub event_loop: AtomicU64,
    /// Ready events returned across all waits.
    pub event_total: AtomicU64,
    pub event_read: AtomicU64,
    pub event_write: AtomicU64,
    pub event_error: AtomicU64,
    /// Connections taken in from the acceptor.
    pub add_stream: AtomicU64,
    /// Connections handed back for cleanup.
    pub ret_stream: AtomicU64,
}

/// Point-in-time copy of `WorkerMetrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub event_loop: u64,
    pub event_total: u64,
    pub event_read: u64,
    pub event_write: u64,
    pub event_error: u64,
    pub add_stream: u64,
    pub ret_stream: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_n(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            event_loop: self.event_loop.load(Ordering::Relaxed),
            event_total: self.event_total.load(Ordering::Relaxed),
            event_read: self.event_read.load(Ordering::Relaxed),
            event_write: self.event_write.load(Ordering::Relaxed),
            event_error: self.event_error.load(Ordering::Relaxed),
            add_stream: self.add_stream.load(Ordering::Relaxed),
            ret_stream: self.ret_stream.load(Ordering::Relaxed),
        }
    }
}
