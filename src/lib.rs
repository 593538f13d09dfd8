//! Knell: the scheduling core of a replicated one-shot timer service.
//!
//! # Overview
//!
//! Knell accepts large numbers of one-shot timers with absolute pop times and
//! efficiently returns the sets whose deadlines have elapsed. Timers are
//! placed into one of four tiers (an overdue set, a fine-grained short
//! wheel, a coarse long wheel, and an overflow heap), giving O(1) amortized
//! insertion and tick processing. As time advances, timers cascade from the
//! coarser tiers into the finer ones until they pop.
//!
//! A dedicated driver thread owns the store behind a single mutex: it pops
//! due batches, dispatches each timer through a [`Callback`] with the mutex
//! released, and sleeps on a condition variable when idle. Ingress (adding,
//! cancelling, replica tracking, rebalance pulls) goes through the same
//! mutex.
//!
//! Timers carry the cluster-view epoch they were scheduled under; a
//! secondary index by view id drives redistribution when the cluster is
//! reconfigured.
//!
//! # Module Structure
//!
//! - [`types`]: identifiers and the wrapping millisecond timestamp
//! - [`clock`]: monotonic time sources, real and virtual
//! - [`config`]: wheel geometry
//! - [`error`]: caller-visible errors
//! - [`timer`]: the scheduled unit and the active/information pair
//! - [`heap`]: the sidecar-indexed overflow heap
//! - [`store`]: the four-tier store, its indices, and the rebalance surface
//! - [`handler`]: the driver thread and its collaborators
//! - [`test_utils`]: logging and assertion helpers for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod heap;
pub mod store;
pub mod test_utils;
pub mod timer;
pub mod types;

pub use clock::{Clock, MonotonicClock, VirtualClock};
pub use config::{ConfigError, WheelConfig};
pub use error::Error;
pub use handler::{Callback, TimerHandler};
pub use store::{GetTimersStatus, HealthSink, NullHealthSink, TimerStore};
pub use timer::{ClusterView, Timer, TimerPair};
pub use types::{Time, TimerId, ViewId};
