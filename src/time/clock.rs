//! Time sources in milliseconds.
//!
//! Schedulers read time through [`TimeSource`], so the same timer queue runs
//! against the wall clock in production and against a [`VirtualClock`] in
//! tests, where time only moves when told to.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic millisecond clock.
pub trait TimeSource {
    /// Milliseconds since the clock's epoch.
    fn now(&self) -> u64;
}

/// Wall clock whose epoch is its creation instant.
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Creates a wall clock reading zero now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually driven clock.
///
/// ```
/// use rivulet::time::{TimeSource, VirtualClock};
///
/// let clock = VirtualClock::new();
/// clock.advance(70);
/// assert_eq!(clock.now(), 70);
/// ```
#[derive(Debug)]
pub struct VirtualClock {
    now: AtomicU64,
    /// While set, `now()` reports `frozen_at` and advancing is a no-op.
    paused: AtomicBool,
    frozen_at: AtomicU64,
}

impl VirtualClock {
    /// Creates a clock at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a clock at `millis`.
    #[must_use]
    pub const fn starting_at(millis: u64) -> Self {
        Self {
            now: AtomicU64::new(millis),
            paused: AtomicBool::new(false),
            frozen_at: AtomicU64::new(millis),
        }
    }

    /// Moves time forward by `millis`.
    pub fn advance(&self, millis: u64) {
        if !self.paused.load(Ordering::Acquire) {
            self.now.fetch_add(millis, Ordering::Release);
        }
    }

    /// Moves time forward to `millis`; earlier targets are ignored.
    pub fn advance_to(&self, millis: u64) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        self.now.fetch_max(millis, Ordering::AcqRel);
    }

    /// Sets the time, even backwards.
    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::Release);
    }

    /// Freezes `now()` at the current time.
    pub fn pause(&self) {
        let current = self.now.load(Ordering::Acquire);
        self.frozen_at.store(current, Ordering::Release);
        self.paused.store(true, Ordering::Release);
    }

    /// Unfreezes the clock without a jump.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> u64 {
        if self.paused.load(Ordering::Acquire) {
            self.frozen_at.load(Ordering::Acquire)
        } else {
            self.now.load(Ordering::Acquire)
        }
    }
}
