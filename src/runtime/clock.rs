//! Coarse wall-clock cache.
//!
//! The worker refreshes this cache once per wait cycle; everything else
//! reads the cached value.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Milliseconds since the Unix epoch, refreshed by `update`.
#[derive(Debug)]
pub struct CoarseClock {
    millis: AtomicI64,
}

impl CoarseClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Re-read the system clock.
    pub fn update(&self) {
        self.millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::Relaxed)
    }
}

impl Default for CoarseClock {
    fn default() -> Self {
        Self::new()
    }
}
