//! Time sources for the scheduler.
//!
//! Scheduling decisions compare millisecond timestamps (last visited,
//! last scheduled, timeouts). Production code uses [`SystemClock`]; tests
//! drive a [`ManualClock`] so that priority decay and timeout reaping can
//! be exercised without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::epoch_millis;

// ── Clock Trait ────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

// ── System Clock ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        epoch_millis()
    }
}

// ── Manual Clock ───────────────────────────────────────────────

/// Virtual clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
