//! Identifier and timestamp types for the timer store.
//!
//! These types wrap the raw integers the store traffics in: globally unique
//! timer identifiers, cluster-view identifiers, and the 32-bit millisecond
//! monotonic timestamp the wheels are indexed by.

use core::fmt;
use serde::Serialize;

/// A globally unique identifier for a timer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TimerId(u64);

impl TimerId {
    /// Creates a timer identifier from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A cluster-configuration epoch identifier.
///
/// Timers record the view they were scheduled under; when the cluster is
/// reconfigured the store is enumerated by view id to find the timers that
/// must be redistributed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ViewId(String);

impl ViewId {
    /// Creates a view identifier.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ViewId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewId({:?})", self.0)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A millisecond timestamp on the monotonic clock.
///
/// Timestamps are 32-bit and wrap roughly every 49.7 days. Every comparison
/// the store performs goes through [`Time::delta`], which interprets the
/// difference as a signed 32-bit value, so wrap-around is transparent as long
/// as no two live timestamps are more than 2³¹ ms apart. The derived `Ord` is
/// a raw ordering used only where the caller has already bounded the spread
/// (the overflow heap).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Time(u32);

impl Time {
    /// The zero instant.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u32) -> Self {
        Self(millis)
    }

    /// Returns the timestamp in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> u32 {
        self.0
    }

    /// Returns the signed difference `self − earlier` in milliseconds.
    ///
    /// A negative result means `self` is before `earlier`.
    #[must_use]
    pub const fn delta(self, earlier: Self) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// Advances the timestamp by `millis`, wrapping on overflow.
    #[must_use]
    pub const fn add_millis(self, millis: u32) -> Self {
        Self(self.0.wrapping_add(millis))
    }

    /// Rounds the timestamp down to a multiple of `resolution_ms`.
    #[must_use]
    pub const fn align_down(self, resolution_ms: u32) -> Self {
        Self(self.0 - self.0 % resolution_ms)
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ms)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}
