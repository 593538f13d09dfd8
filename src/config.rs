//! Wheel geometry configuration.

use thiserror::Error;

/// Error returned when a [`WheelConfig`] is structurally invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A bucket count or resolution was zero or not a power of two.
    #[error("{field} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo {
        /// The offending field name.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },
    /// The combined long-wheel horizon does not fit signed 32-bit arithmetic.
    #[error("long wheel horizon {horizon_ms} ms exceeds the maximum of {max_ms} ms")]
    HorizonTooLarge {
        /// The configured horizon in milliseconds.
        horizon_ms: u64,
        /// The largest representable horizon.
        max_ms: u64,
    },
}

/// Geometry of the two timer wheels.
///
/// The short wheel has `short_buckets` buckets of `short_resolution_ms` each;
/// the long wheel's resolution is the short wheel's full period, so one long
/// bucket redistributes into exactly one short-wheel rotation. All values
/// must be powers of two so that bucket indexing stays consistent across
/// timestamp wrap-around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelConfig {
    /// Width of one short-wheel bucket in milliseconds.
    pub short_resolution_ms: u32,
    /// Number of short-wheel buckets.
    pub short_buckets: usize,
    /// Number of long-wheel buckets.
    pub long_buckets: usize,
}

impl WheelConfig {
    /// The production geometry: 128 × 8 ms short buckets (1024 ms) and
    /// 4096 × 1024 ms long buckets (~70 min).
    #[must_use]
    pub const fn canonical() -> Self {
        Self {
            short_resolution_ms: 8,
            short_buckets: 128,
            long_buckets: 4096,
        }
    }

    /// A coarser geometry for tests: fewer, larger buckets mean less work
    /// when a test grinds through a long stretch of simulated ticks. The
    /// wheel algorithms do not depend on particular bucket sizes.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            short_resolution_ms: 256,
            short_buckets: 4,
            long_buckets: 2048,
        }
    }

    /// Sets the short-wheel bucket width.
    #[must_use]
    pub const fn short_resolution(mut self, millis: u32) -> Self {
        self.short_resolution_ms = millis;
        self
    }

    /// Sets the short-wheel bucket count.
    #[must_use]
    pub const fn short_buckets(mut self, buckets: usize) -> Self {
        self.short_buckets = buckets;
        self
    }

    /// Sets the long-wheel bucket count.
    #[must_use]
    pub const fn long_buckets(mut self, buckets: usize) -> Self {
        self.long_buckets = buckets;
        self
    }

    /// Total span of the short wheel in milliseconds.
    #[must_use]
    pub const fn short_period_ms(&self) -> u32 {
        self.short_resolution_ms * self.short_buckets as u32
    }

    /// Width of one long-wheel bucket: the short wheel's full period.
    #[must_use]
    pub const fn long_resolution_ms(&self) -> u32 {
        self.short_period_ms()
    }

    /// Total span of the long wheel in milliseconds.
    #[must_use]
    pub const fn long_period_ms(&self) -> u32 {
        self.long_resolution_ms() * self.long_buckets as u32
    }

    /// Checks the geometry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields: [(&'static str, u64); 3] = [
            ("short_resolution_ms", u64::from(self.short_resolution_ms)),
            ("short_buckets", self.short_buckets as u64),
            ("long_buckets", self.long_buckets as u64),
        ];
        for (field, value) in fields {
            if value == 0 || !value.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo { field, value });
            }
        }

        let horizon = u64::from(self.short_resolution_ms)
            * self.short_buckets as u64
            * self.long_buckets as u64;
        if horizon > i32::MAX as u64 {
            return Err(ConfigError::HorizonTooLarge {
                horizon_ms: horizon,
                max_ms: i32::MAX as u64,
            });
        }
        Ok(())
    }
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self::canonical()
    }
}
