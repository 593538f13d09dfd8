//! Monotonic time sources for the store and its tests.
//!
//! The store never reads the wall clock directly; it is handed a [`Clock`]
//! at construction. Production code uses [`MonotonicClock`]; tests use
//! [`VirtualClock`] and advance time explicitly, which makes tick processing
//! fully deterministic.

use crate::types::Time;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// A source of monotonic millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Production clock backed by [`std::time::Instant`].
///
/// The epoch is the moment the clock was created; timestamps wrap after
/// roughly 49.7 days of uptime, which the store's wrapping arithmetic
/// tolerates.
#[derive(Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Creates a clock anchored at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Time {
        Time::from_millis(self.epoch.elapsed().as_millis() as u32)
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only advances when told to.
///
/// # Example
///
/// ```
/// use knell::clock::{Clock, VirtualClock};
/// use knell::types::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
/// clock.advance(1000);
/// assert_eq!(clock.now(), Time::from_millis(1000));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now_ms: AtomicU32,
}

impl VirtualClock {
    /// Creates a virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now_ms: AtomicU32::new(time.as_millis()),
        }
    }

    /// Advances time by `millis`.
    pub fn advance(&self, millis: u32) {
        self.now_ms.fetch_add(millis, Ordering::Release);
    }

    /// Moves time to the given instant. A target in the past is a no-op.
    pub fn advance_to(&self, time: Time) {
        let target = time.as_millis();
        loop {
            let current = self.now_ms.load(Ordering::Acquire);
            if time.delta(Time::from_millis(current)) <= 0 {
                break;
            }
            if self
                .now_ms
                .compare_exchange_weak(current, target, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Time {
        Time::from_millis(self.now_ms.load(Ordering::Acquire))
    }
}
