//! Monotonic clock abstraction.
//!
//! Kept host-scoped per the source's "global callbacks should be host-scoped"
//! note, rather than a process-global `enet_time_get`.

use std::time::Instant;

/// A monotonic millisecond clock. All comparisons in the engine fold at
/// 32-bit wraparound (see [`crate::sequence`]), so only the low 32 bits of
/// elapsed milliseconds matter.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Wall-clock implementation backed by `std::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// A clock a test drives explicitly, so retransmission/timeout scenarios
/// don't depend on wall-clock sleeps.
pub struct ManualClock {
    now: std::cell::Cell<u32>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: std::cell::Cell::new(0),
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}
