//! Time seam for elapsed-latency measurement.
//!
//! Watchers never read a clock themselves; the coordinator stamps each
//! event with `now` on the way in, which keeps every watcher a plain
//! state machine and makes latency classification deterministic in
//! tests.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time since an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
}

/// Wall clock with its origin captured at construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for tests and the replay harness. Clones share
/// the same underlying position, so one clone can live inside the
/// coordinator while another advances it.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    position: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock::default()
    }

    pub fn set_ms(&self, ms: u64) {
        self.position.set(Duration::from_millis(ms));
    }

    pub fn advance(&self, by: Duration) {
        self.position.set(self.position.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.position.get()
    }
}
