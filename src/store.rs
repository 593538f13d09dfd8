//! The four-tier timer store.
//!
//! Timers live in one of four structures according to how far ahead their
//! pop time is:
//!
//! - an *overdue* set for timers whose deadline has already passed;
//! - a *short wheel* of fine buckets covering the next
//!   [`WheelConfig::short_period_ms`];
//! - a *long wheel* of coarse buckets (one short-wheel period each) covering
//!   the next [`WheelConfig::long_period_ms`];
//! - an overflow *heap* for everything further out.
//!
//! The store tracks the next tick to process, `tick_timestamp`, always a
//! multiple of the short resolution. Processing a tick drains the current
//! short bucket. Each time the tick crosses a long-bucket boundary, the long
//! bucket now aligned with the upcoming short-wheel rotation is redistributed
//! into the short wheel; each time it crosses a full long-wheel rotation, the
//! heap is first drained of everything due within the next long period.
//!
//! A consequence of cascading is that a timer's location cannot be computed
//! from its pop time alone once ticks have elapsed: a timer that entered the
//! heap stays there until the next rotation boundary even when its deadline
//! has drifted inside the long horizon. Placement arithmetic is therefore
//! trusted first, with a full scan kept as the recovery path on a miss.
//!
//! Two indices sit next to the wheels: `by_id` owns every stored
//! [`TimerPair`] and maps timer id to it, and `by_view` maps each cluster
//! view id to the ids scheduled (or retained) under it. The wheels, overdue
//! set, and heap hold ids only, so every pair exists in exactly one place.

use crate::clock::Clock;
use crate::config::{ConfigError, WheelConfig};
use crate::heap::TimerHeap;
use crate::timer::TimerPair;
use crate::types::{Time, TimerId, ViewId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Collaborator notified when a timer is successfully added.
///
/// A steady stream of notifications signals scheduler liveness to an
/// external health reporter.
pub trait HealthSink: Send {
    /// Called after each successful placement.
    fn on_successful_add(&self);
}

/// A [`HealthSink`] that ignores notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHealthSink;

impl HealthSink for NullHealthSink {
    fn on_successful_add(&self) {}
}

/// Outcome of a rebalance pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetTimersStatus {
    /// Every matching timer was returned.
    Complete,
    /// The response was truncated at the requested maximum; more remain.
    Partial,
}

/// Where a pop time lands relative to the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Overdue,
    Short(usize),
    Long(usize),
    Heap,
}

/// The hierarchical timer store.
pub struct TimerStore {
    config: WheelConfig,
    clock: Arc<dyn Clock>,
    health: Box<dyn HealthSink>,

    overdue: HashSet<TimerId>,
    short_wheel: Vec<HashSet<TimerId>>,
    long_wheel: Vec<HashSet<TimerId>>,
    heap: TimerHeap,

    /// The next tick to process; always a multiple of the short resolution.
    tick_timestamp: Time,

    by_id: HashMap<TimerId, TimerPair>,
    by_view: BTreeMap<ViewId, HashSet<TimerId>>,
}

impl TimerStore {
    /// Creates an empty store.
    ///
    /// The tick clock starts at the current time rounded down to the short
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the wheel geometry is invalid.
    pub fn new(
        config: WheelConfig,
        clock: Arc<dyn Clock>,
        health: Box<dyn HealthSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let tick_timestamp = clock.now().align_down(config.short_resolution_ms);
        Ok(Self {
            overdue: HashSet::new(),
            short_wheel: vec![HashSet::new(); config.short_buckets],
            long_wheel: vec![HashSet::new(); config.long_buckets],
            heap: TimerHeap::new(),
            tick_timestamp,
            by_id: HashMap::new(),
            by_view: BTreeMap::new(),
            config,
            clock,
            health,
        })
    }

    /// Number of timers owned by the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the store owns no timers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// The next tick the store will process.
    #[must_use]
    pub fn current_tick(&self) -> Time {
        self.tick_timestamp
    }

    /// Inserts a pair, replacing any pair already stored under the same id.
    ///
    /// The pair is placed in the structure its pop time selects and indexed
    /// under its active view id and, if present, its information timer's
    /// view id.
    pub fn insert(&mut self, pair: TimerPair) {
        let id = pair.id();
        if self.by_id.contains_key(&id) {
            trace!(%id, "insert replaces existing timer");
            let _previous = self.fetch(id);
        }

        let pop_time = pair.pop_time();
        self.place(id, pop_time);
        self.index_views(&pair);
        self.by_id.insert(id, pair);
        self.health.on_successful_add();
        trace!(%id, %pop_time, tick = %self.tick_timestamp, "timer inserted");
    }

    /// Removes and returns the pair stored under `id`.
    ///
    /// The caller takes ownership; this is both the cancellation primitive
    /// and the first half of a fetch-mutate-reinsert from the driver.
    pub fn fetch(&mut self, id: TimerId) -> Option<TimerPair> {
        let pair = self.by_id.remove(&id)?;
        self.remove_from_structure(id, pair.pop_time());
        self.unindex_views(&pair);
        Some(pair)
    }

    /// Collects the next batch of due timers into `out`.
    ///
    /// Overdue timers are always drained first and returned without touching
    /// the tick clock. Otherwise ticks are processed oldest bucket first,
    /// cascading the coarser structures at their boundaries, but only up to
    /// the current time: a bucket is drained once its full window has
    /// elapsed, so nothing is ever delivered early. Returns after the first
    /// tick that yields timers, which keeps distinct pop times in distinct
    /// batches; leaves `out` empty once the tick has caught up with the
    /// clock.
    ///
    /// Everything returned is removed from the store and owned by the
    /// caller.
    pub fn fetch_next_timers(&mut self, out: &mut HashSet<TimerPair>) {
        let now = self.clock.now();
        loop {
            let overdue = std::mem::take(&mut self.overdue);
            self.drain_ids(overdue, out);
            if !out.is_empty() {
                debug!(count = out.len(), "popped overdue timers");
                return;
            }

            if now.delta(self.tick_timestamp) < self.config.short_resolution_ms as i32 {
                return;
            }

            let index = self.short_index(self.tick_timestamp);
            let bucket = std::mem::take(&mut self.short_wheel[index]);
            self.drain_ids(bucket, out);

            self.tick_timestamp = self
                .tick_timestamp
                .add_millis(self.config.short_resolution_ms);
            self.maybe_refill_wheels();

            if !out.is_empty() {
                debug!(
                    count = out.len(),
                    tick = %self.tick_timestamp,
                    "popped tick bucket"
                );
                return;
            }
        }
    }

    /// Empties every structure and index.
    pub fn clear(&mut self) {
        self.overdue.clear();
        for bucket in &mut self.short_wheel {
            bucket.clear();
        }
        for bucket in &mut self.long_wheel {
            bucket.clear();
        }
        self.heap.clear();
        self.by_id.clear();
        self.by_view.clear();
    }

    /// Pairs scheduled or retained under the given view.
    pub fn pairs_in_view<'a>(
        &'a self,
        view: &ViewId,
    ) -> impl Iterator<Item = &'a TimerPair> + 'a {
        self.by_view
            .get(view)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(move |id| self.by_id.get(id))
    }

    /// Pairs indexed under any view other than `current_view`.
    ///
    /// A pair indexed under two non-current views (an active and an
    /// information view) is yielded once per bucket; callers that need each
    /// pair once deduplicate by id.
    pub fn pairs_outside_view<'a>(
        &'a self,
        current_view: &'a ViewId,
    ) -> impl Iterator<Item = &'a TimerPair> + 'a {
        self.by_view
            .iter()
            .filter(move |(view, _)| *view != current_view)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(move |id| self.by_id.get(id))
    }

    /// Marks replica `replica_index` of the pair's active timer as up to
    /// date. Returns whether the id was found.
    ///
    /// Once every replica has acknowledged, a retained information timer has
    /// served its purpose and is dropped.
    pub fn update_replica_tracker(&mut self, id: TimerId, replica_index: usize) -> bool {
        let Some(pair) = self.by_id.get_mut(&id) else {
            return false;
        };
        pair.active.update_replica_tracker(replica_index);

        let mut reconciled_view = None;
        if pair.active.all_replicas_tracked() {
            if let Some(information) = pair.information.take() {
                trace!(%id, "replica reconciliation complete, dropping information timer");
                if information.cluster_view_id != pair.active.cluster_view_id {
                    reconciled_view = Some(information.cluster_view_id);
                }
            }
        }
        if let Some(view) = reconciled_view {
            self.unindex_one(&view, id);
        }
        true
    }

    /// Selects up to `max` timers for `node` that were scheduled under a
    /// view other than `current_view`, serialized as a JSON body.
    ///
    /// This is the pull side of cluster rebalancing: a node that joined (or
    /// survived) a reconfiguration asks for the timers it should now own.
    #[must_use]
    pub fn get_timers_for_node(
        &self,
        node: &str,
        max: usize,
        current_view: &ViewId,
    ) -> (GetTimersStatus, String) {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        let mut truncated = false;

        for pair in self.pairs_outside_view(current_view) {
            if pair.active.cluster_view_id == *current_view {
                continue;
            }
            if !seen.insert(pair.id()) {
                continue;
            }
            if !pair.active.replicas.iter().any(|replica| replica == node) {
                continue;
            }
            if selected.len() == max {
                truncated = true;
                break;
            }
            selected.push(&pair.active);
        }

        let status = if truncated {
            GetTimersStatus::Partial
        } else {
            GetTimersStatus::Complete
        };
        let count = selected.len();
        let body = serde_json::json!({ "timers": selected }).to_string();
        debug!(node, count, ?status, "rebalance pull");
        (status, body)
    }

    /// Removes the ids in `bucket` from both indices and moves their pairs
    /// into `out`.
    fn drain_ids(&mut self, bucket: HashSet<TimerId>, out: &mut HashSet<TimerPair>) {
        for id in bucket {
            if let Some(pair) = self.by_id.remove(&id) {
                self.unindex_views(&pair);
                out.insert(pair);
            }
        }
    }

    /// Redistributes wheels after a tick, if the new tick sits on a
    /// long-bucket or long-rotation boundary. Safe to call unconditionally.
    fn maybe_refill_wheels(&mut self) {
        let tick = self.tick_timestamp.as_millis();
        if tick % self.config.long_resolution_ms() == 0 {
            if tick % self.config.long_period_ms() == 0 {
                self.refill_long_wheel();
            }
            self.refill_short_wheel();
        }
    }

    /// Drains the heap of everything due within the next long-wheel rotation
    /// and re-places it. Entries with equal pop times drain in id order.
    fn refill_long_wheel(&mut self) {
        let horizon = self.config.long_period_ms() as i32;
        let mut moved = 0usize;
        while let Some((pop_time, id)) = self.heap.peek() {
            if pop_time.delta(self.tick_timestamp) >= horizon {
                break;
            }
            self.heap.pop();
            self.place(id, pop_time);
            moved += 1;
        }
        if moved > 0 {
            debug!(moved, tick = %self.tick_timestamp, "refilled long wheel from heap");
        }
    }

    /// Redistributes the long bucket now aligned with the upcoming
    /// short-wheel rotation.
    fn refill_short_wheel(&mut self) {
        let index = self.long_index(self.tick_timestamp);
        let bucket = std::mem::take(&mut self.long_wheel[index]);
        let moved = bucket.len();
        for id in bucket {
            match self.by_id.get(&id) {
                Some(pair) => {
                    let pop_time = pair.pop_time();
                    self.place(id, pop_time);
                }
                None => warn!(%id, "long wheel held an unindexed timer id"),
            }
        }
        if moved > 0 {
            debug!(moved, tick = %self.tick_timestamp, "refilled short wheel from long wheel");
        }
    }

    /// Adds `id` to the structure selected by `pop_time`.
    fn place(&mut self, id: TimerId, pop_time: Time) {
        match self.placement_for(pop_time) {
            Placement::Overdue => {
                self.overdue.insert(id);
            }
            Placement::Short(index) => {
                self.short_wheel[index].insert(id);
            }
            Placement::Long(index) => {
                self.long_wheel[index].insert(id);
            }
            Placement::Heap => {
                self.heap.insert(pop_time, id);
            }
        }
    }

    fn placement_for(&self, pop_time: Time) -> Placement {
        let delta = pop_time.delta(self.tick_timestamp);
        if delta < 0 {
            Placement::Overdue
        } else if delta < self.config.short_period_ms() as i32 {
            Placement::Short(self.short_index(pop_time))
        } else if delta < self.config.long_period_ms() as i32 {
            Placement::Long(self.long_index(pop_time))
        } else {
            Placement::Heap
        }
    }

    fn short_index(&self, time: Time) -> usize {
        (time.as_millis() / self.config.short_resolution_ms) as usize % self.config.short_buckets
    }

    fn long_index(&self, time: Time) -> usize {
        (time.as_millis() / self.config.long_resolution_ms()) as usize % self.config.long_buckets
    }

    /// Removes `id` from the structure its pop time selects, falling back to
    /// a full scan if it is not where the arithmetic says.
    fn remove_from_structure(&mut self, id: TimerId, pop_time: Time) {
        let found = match self.placement_for(pop_time) {
            Placement::Overdue => self.overdue.remove(&id),
            Placement::Short(index) => self.short_wheel[index].remove(&id),
            Placement::Long(index) => self.long_wheel[index].remove(&id),
            Placement::Heap => self.heap.remove(id),
        };
        if !found {
            self.purge_from_wheels(id);
        }
    }

    /// Scans every structure for `id` and removes the first occurrence.
    ///
    /// This is expensive and only reached when the store's placement
    /// arithmetic disagrees with where a timer actually sits, which after a
    /// cascade is possible for timers that crossed a tier boundary between
    /// rotations.
    fn purge_from_wheels(&mut self, id: TimerId) {
        warn!(%id, tick = %self.tick_timestamp, "timer not in computed bucket, scanning all structures");
        if self.overdue.remove(&id) {
            return;
        }
        for bucket in &mut self.short_wheel {
            if bucket.remove(&id) {
                return;
            }
        }
        for bucket in &mut self.long_wheel {
            if bucket.remove(&id) {
                return;
            }
        }
        self.heap.remove(id);
    }

    fn index_views(&mut self, pair: &TimerPair) {
        let id = pair.id();
        self.by_view
            .entry(pair.active.cluster_view_id.clone())
            .or_default()
            .insert(id);
        if let Some(information) = &pair.information {
            if information.cluster_view_id != pair.active.cluster_view_id {
                self.by_view
                    .entry(information.cluster_view_id.clone())
                    .or_default()
                    .insert(id);
            }
        }
    }

    fn unindex_views(&mut self, pair: &TimerPair) {
        let active_view = pair.active.cluster_view_id.clone();
        self.unindex_one(&active_view, pair.id());
        if let Some(information) = &pair.information {
            if information.cluster_view_id != active_view {
                let view = information.cluster_view_id.clone();
                self.unindex_one(&view, pair.id());
            }
        }
    }

    fn unindex_one(&mut self, view: &ViewId, id: TimerId) {
        if let Some(ids) = self.by_view.get_mut(view) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_view.remove(view);
            }
        }
    }
}

impl fmt::Debug for TimerStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerStore")
            .field("len", &self.by_id.len())
            .field("overdue", &self.overdue.len())
            .field("heap", &self.heap.len())
            .field("tick_timestamp", &self.tick_timestamp)
            .field("views", &self.by_view.len())
            .finish_non_exhaustive()
    }
}
