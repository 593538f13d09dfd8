//! The scheduled unit: timers, active/information pairs, and the cluster
//! view applied on dispatch.
//!
//! A [`Timer`] is opaque to the scheduler beyond its id, pop time, view id,
//! tombstone flag, and sequence number. The store buckets [`TimerPair`]s: an
//! *active* timer (the currently scheduled instance) plus an optional
//! *information* timer, the previous cluster view's copy retained across a
//! reconfiguration so replicas can reconcile.

use crate::error::Error;
use crate::types::{Time, TimerId, ViewId};
use serde::Serialize;
use std::hash::{Hash, Hasher};

/// The largest schedulable delay in milliseconds.
///
/// Differences on the wrapping 32-bit clock are signed, so anything at or
/// beyond 2³¹ ms ahead would read as a pop time in the past.
pub const MAX_DELAY_MS: u32 = i32::MAX as u32;

/// A one-shot timer.
#[derive(Debug, Clone, Serialize)]
pub struct Timer {
    /// Globally unique identifier.
    pub id: TimerId,
    /// Absolute pop time on the monotonic clock.
    pub pop_time: Time,
    /// The cluster-configuration epoch this timer was scheduled under.
    pub cluster_view_id: ViewId,
    /// A tombstone is kept only to suppress a stale replica and is reaped
    /// silently on pop.
    pub tombstone: bool,
    /// Incremented by the driver before each dispatch.
    pub sequence_number: u32,
    /// Addresses of the replica nodes responsible for this timer.
    pub replicas: Vec<String>,
    /// Bitmap of replicas known to hold an up-to-date copy.
    pub replica_tracker: u32,
}

impl Timer {
    /// Creates a timer due `delay_ms` after `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPopTime`] if the delay is 2³¹ ms or more.
    pub fn from_delay(
        id: TimerId,
        now: Time,
        delay_ms: u32,
        view: ViewId,
    ) -> Result<Self, Error> {
        if delay_ms > MAX_DELAY_MS {
            return Err(Error::InvalidPopTime {
                delay_ms,
                max_ms: MAX_DELAY_MS,
            });
        }
        Ok(Self::at(id, now.add_millis(delay_ms), view))
    }

    /// Creates a timer with an explicit absolute pop time.
    #[must_use]
    pub fn at(id: TimerId, pop_time: Time, view: ViewId) -> Self {
        Self {
            id,
            pop_time,
            cluster_view_id: view,
            tombstone: false,
            sequence_number: 0,
            replicas: Vec::new(),
            replica_tracker: 0,
        }
    }

    /// Whether this timer is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// Marks replica `replica_index` as holding an up-to-date copy.
    ///
    /// Indices beyond the tracker width are ignored.
    pub fn update_replica_tracker(&mut self, replica_index: usize) {
        if replica_index < u32::BITS as usize {
            self.replica_tracker |= 1 << replica_index;
        }
    }

    /// Whether every replica in `replicas` has been marked up to date.
    #[must_use]
    pub fn all_replicas_tracked(&self) -> bool {
        let wanted = self.replicas.len().min(u32::BITS as usize);
        let mask = if wanted == u32::BITS as usize {
            u32::MAX
        } else {
            (1u32 << wanted) - 1
        };
        self.replica_tracker & mask == mask
    }

    /// Refreshes the timer against the current cluster view.
    ///
    /// Called by the driver just before dispatch. If the timer was scheduled
    /// under an older view its view id and replica list are rewritten and
    /// the replica tracker starts over.
    pub fn update_cluster_information(&mut self, view: &ClusterView) {
        if self.cluster_view_id != view.id {
            self.cluster_view_id = view.id.clone();
            self.replicas = view.replicas.clone();
            self.replica_tracker = 0;
        }
    }
}

/// The current cluster configuration as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    /// The configuration epoch identifier.
    pub id: ViewId,
    /// Replica node addresses under this configuration.
    pub replicas: Vec<String>,
}

impl ClusterView {
    /// Creates a cluster view.
    #[must_use]
    pub fn new(id: ViewId, replicas: Vec<String>) -> Self {
        Self { id, replicas }
    }
}

/// The unit stored in buckets: the active timer plus the previous view's
/// copy, if one is being retained across a reconfiguration.
///
/// Equality compares timer identities (the active ids must match and the
/// information ids must match); the hash is the active timer's id. Pairs
/// without an active timer are not representable.
#[derive(Debug, Clone)]
pub struct TimerPair {
    /// The currently scheduled instance. Determines pop and placement.
    pub active: Timer,
    /// The previous cluster view's copy, kept for replica reconciliation.
    /// Never a scheduling input.
    pub information: Option<Timer>,
}

impl TimerPair {
    /// Creates a pair with no information timer.
    #[must_use]
    pub fn new(active: Timer) -> Self {
        Self {
            active,
            information: None,
        }
    }

    /// Creates a pair retaining `information` from an earlier view.
    #[must_use]
    pub fn with_information(active: Timer, information: Timer) -> Self {
        Self {
            active,
            information: Some(information),
        }
    }

    /// The pair's identity: the active timer's id.
    #[must_use]
    pub fn id(&self) -> TimerId {
        self.active.id
    }

    /// The active timer's absolute pop time.
    #[must_use]
    pub fn pop_time(&self) -> Time {
        self.active.pop_time
    }
}

impl PartialEq for TimerPair {
    fn eq(&self, other: &Self) -> bool {
        self.active.id == other.active.id
            && self.information.as_ref().map(|t| t.id)
                == other.information.as_ref().map(|t| t.id)
    }
}

impl Eq for TimerPair {}

impl Hash for TimerPair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.active.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(id: u64, pop: u32) -> Timer {
        Timer::at(TimerId::new(id), Time::from_millis(pop), ViewId::new("v1"))
    }

    #[test]
    fn from_delay_rejects_unrepresentable() {
        let err = Timer::from_delay(
            TimerId::new(1),
            Time::ZERO,
            MAX_DELAY_MS + 1,
            ViewId::new("v1"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::InvalidPopTime {
                delay_ms: MAX_DELAY_MS + 1,
                max_ms: MAX_DELAY_MS,
            }
        );
        assert!(Timer::from_delay(TimerId::new(1), Time::ZERO, MAX_DELAY_MS, ViewId::new("v1"))
            .is_ok());
    }

    #[test]
    fn pair_equality_is_by_identity() {
        let a = TimerPair::new(timer(1, 100));
        let b = TimerPair::new(timer(1, 999));
        assert_eq!(a, b);

        let c = TimerPair::with_information(timer(1, 100), timer(2, 50));
        assert_ne!(a, c);
        let d = TimerPair::with_information(timer(1, 100), timer(2, 75));
        assert_eq!(c, d);
    }

    #[test]
    fn replica_tracker_round_trip() {
        let mut t = timer(1, 100);
        t.replicas = vec!["10.0.0.1:7253".into(), "10.0.0.2:7253".into()];
        assert!(!t.all_replicas_tracked());
        t.update_replica_tracker(0);
        assert!(!t.all_replicas_tracked());
        t.update_replica_tracker(1);
        assert!(t.all_replicas_tracked());
        // Out-of-range indices must not panic or corrupt the bitmap.
        t.update_replica_tracker(64);
        assert!(t.all_replicas_tracked());
    }

    #[test]
    fn cluster_information_rewrites_stale_view() {
        let mut t = timer(1, 100);
        t.replicas = vec!["10.0.0.1:7253".into()];
        t.replica_tracker = 1;

        let same = ClusterView::new(ViewId::new("v1"), vec!["10.0.0.9:7253".into()]);
        t.update_cluster_information(&same);
        assert_eq!(t.replicas, vec!["10.0.0.1:7253".to_string()]);
        assert_eq!(t.replica_tracker, 1);

        let next = ClusterView::new(ViewId::new("v2"), vec!["10.0.0.9:7253".into()]);
        t.update_cluster_information(&next);
        assert_eq!(t.cluster_view_id, ViewId::new("v2"));
        assert_eq!(t.replicas, vec!["10.0.0.9:7253".to_string()]);
        assert_eq!(t.replica_tracker, 0);
    }
}
