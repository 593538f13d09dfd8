//! Caller-visible error types.

use thiserror::Error;

/// Errors surfaced to callers of the timer service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The requested delay cannot be represented on the 32-bit wrapping
    /// clock. Timestamp differences are interpreted as signed 32-bit values,
    /// so a delay of 2³¹ ms or more would be indistinguishable from a pop
    /// time in the past.
    #[error("delay of {delay_ms} ms is not schedulable; the maximum is {max_ms} ms")]
    InvalidPopTime {
        /// The rejected delay.
        delay_ms: u32,
        /// The largest schedulable delay.
        max_ms: u32,
    },
}
