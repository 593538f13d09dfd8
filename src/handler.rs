//! The driver thread that pops due timers and dispatches them.
//!
//! A [`TimerHandler`] owns the store behind one mutex and runs a dedicated
//! thread: under the mutex it asks the store for the next due batch,
//! releases the mutex, dispatches each timer through the [`Callback`], then
//! reacquires and blocks on a condition variable until the next poll or an
//! insertion wakes it. Releasing the mutex around dispatch means an
//! in-flight callback is never preempted by shutdown and ingress is never
//! blocked behind replication work.
//!
//! All outside access (adding timers, cancelling, replica tracking, the
//! rebalance pull) goes through the handler and takes the same mutex.

use crate::store::{GetTimersStatus, TimerStore};
use crate::timer::{ClusterView, Timer, TimerPair};
use crate::types::{Time, TimerId, ViewId};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// How long the driver sleeps when nothing is due.
///
/// The driver polls rather than computing an exact deadline; a missed
/// condition-variable signal then costs at most one poll interval.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Collaborator that takes ownership of popped timers.
///
/// Never invoked with a tombstone, and always after the timer's sequence
/// number has been incremented.
pub trait Callback: Send {
    /// Takes ownership of a popped timer for replication and delivery.
    fn perform(&self, timer: Timer);
}

struct HandlerState {
    store: TimerStore,
    cluster_view: ClusterView,
    terminate: bool,
    /// Pop time of the earliest timer inserted since the driver last went
    /// idle; used to decide whether an insert needs to wake the driver.
    nearest_new_pop: Option<Time>,
}

struct HandlerInner {
    state: Mutex<HandlerState>,
    condvar: Condvar,
}

/// The timer driver: owns the store and the thread that pops it.
pub struct TimerHandler {
    inner: Arc<HandlerInner>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandler {
    /// Takes ownership of the store and starts the driver thread.
    ///
    /// Thread creation failure is fatal.
    #[must_use]
    pub fn new(
        store: TimerStore,
        cluster_view: ClusterView,
        callback: Box<dyn Callback>,
    ) -> Self {
        let inner = Arc::new(HandlerInner {
            state: Mutex::new(HandlerState {
                store,
                cluster_view,
                terminate: false,
                nearest_new_pop: None,
            }),
            condvar: Condvar::new(),
        });

        let thread_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("knell-handler".to_string())
            .spawn(move || run(&thread_inner, callback.as_ref()))
            .expect("failed to spawn timer handler thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Transfers a timer into the store, waking the driver if the new timer
    /// pops earlier than anything it is currently waiting for.
    ///
    /// An existing timer with the same id is replaced; if the replacement
    /// was scheduled under a different cluster view, the replaced active
    /// timer is retained as the pair's information timer so replicas of the
    /// old view can still be reconciled.
    pub fn add_timer(&self, timer: Timer) {
        let mut state = self.lock_state();
        debug!(id = %timer.id, pop = %timer.pop_time, "adding timer");

        let pop_time = timer.pop_time;
        let pair = match state.store.fetch(timer.id) {
            Some(existing) if existing.active.cluster_view_id != timer.cluster_view_id => {
                trace!(id = %timer.id, "view changed, retaining replaced timer as information");
                TimerPair::with_information(timer, existing.active)
            }
            Some(existing) => TimerPair {
                active: timer,
                information: existing.information,
            },
            None => TimerPair::new(timer),
        };
        state.store.insert(pair);

        let wake = match state.nearest_new_pop {
            None => true,
            Some(nearest) => pop_time.delta(nearest) < 0,
        };
        if wake {
            state.nearest_new_pop = Some(pop_time);
            self.inner.condvar.notify_one();
        }
    }

    /// Removes and returns the pair stored under `id`.
    ///
    /// The caller owns the result; dropping it cancels the timer.
    pub fn fetch(&self, id: TimerId) -> Option<TimerPair> {
        self.lock_state().store.fetch(id)
    }

    /// Forwards a replica acknowledgement to the stored timer. Returns
    /// whether the id was found.
    pub fn update_replica_tracker(&self, id: TimerId, replica_index: usize) -> bool {
        self.lock_state()
            .store
            .update_replica_tracker(id, replica_index)
    }

    /// Serves a rebalance pull request: up to `max` timers for `node` whose
    /// view differs from `current_view`.
    #[must_use]
    pub fn get_timers_for_node(
        &self,
        node: &str,
        max: usize,
        current_view: &ViewId,
    ) -> (GetTimersStatus, String) {
        self.lock_state()
            .store
            .get_timers_for_node(node, max, current_view)
    }

    /// Installs a new cluster view.
    ///
    /// Timers are refreshed lazily: each one re-examines the view when it
    /// pops.
    pub fn set_cluster_view(&self, view: ClusterView) {
        debug!(view = %view.id, "cluster view updated");
        self.lock_state().cluster_view = view;
    }

    /// Number of timers currently owned by the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().store.len()
    }

    /// Whether the store owns no timers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().store.is_empty()
    }

    /// Stops the driver thread and waits for it to exit.
    ///
    /// The current dispatch, if one is in flight, completes; any batch
    /// popped but not yet dispatched is dropped without callbacks. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            {
                let mut state = self.lock_state();
                state.terminate = true;
                self.inner.condvar.notify_one();
            }
            let _ = thread.join();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandlerState> {
        self.inner
            .state
            .lock()
            .expect("timer handler mutex poisoned")
    }
}

impl Drop for TimerHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("TimerHandler")
            .field("store", &state.store)
            .field("cluster_view", &state.cluster_view.id)
            .field("terminate", &state.terminate)
            .finish_non_exhaustive()
    }
}

/// The driver loop. Holds the mutex except while dispatching a batch.
fn run(inner: &HandlerInner, callback: &dyn Callback) {
    let mut batch: HashSet<TimerPair> = HashSet::new();
    let mut guard = inner
        .state
        .lock()
        .expect("timer handler mutex poisoned");

    guard.store.fetch_next_timers(&mut batch);

    while !guard.terminate {
        if batch.is_empty() {
            guard.nearest_new_pop = None;
            let (reacquired, _timeout) = inner
                .condvar
                .wait_timeout(guard, IDLE_WAIT)
                .expect("failed to wait on timer handler condvar");
            guard = reacquired;
        } else {
            trace!(count = batch.len(), "dispatching batch");
            let view = guard.cluster_view.clone();
            drop(guard);
            dispatch(&mut batch, &view, callback);
            guard = inner
                .state
                .lock()
                .expect("timer handler mutex poisoned");
        }

        guard.store.fetch_next_timers(&mut batch);
    }

    // Terminated with a batch in hand: the timers are dropped undelivered.
    batch.clear();
}

/// Dispatches every timer in the batch, emptying it. Takes ownership of the
/// timers: tombstones are reaped here, everything else goes to the callback.
fn dispatch(batch: &mut HashSet<TimerPair>, view: &ClusterView, callback: &dyn Callback) {
    for pair in batch.drain() {
        let mut timer = pair.active;
        if timer.is_tombstone() {
            debug!(id = %timer.id, "discarding expired tombstone");
            continue;
        }

        timer.sequence_number += 1;
        timer.update_cluster_information(view);
        callback.perform(timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};
    use crate::config::WheelConfig;
    use crate::store::NullHealthSink;
    use crate::types::ViewId;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    struct ChannelCallback(mpsc::Sender<Timer>);

    impl Callback for ChannelCallback {
        fn perform(&self, timer: Timer) {
            let _ = self.0.send(timer);
        }
    }

    fn handler_at(
        start_ms: u32,
        view: &str,
    ) -> (Arc<VirtualClock>, mpsc::Receiver<Timer>, TimerHandler) {
        let clock = Arc::new(VirtualClock::starting_at(Time::from_millis(start_ms)));
        let store = TimerStore::new(
            WheelConfig::canonical(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            Box::new(NullHealthSink),
        )
        .expect("valid config");
        let (tx, rx) = mpsc::channel();
        let handler = TimerHandler::new(
            store,
            ClusterView::new(ViewId::new(view), vec!["10.0.0.1:7253".into()]),
            Box::new(ChannelCallback(tx)),
        );
        (clock, rx, handler)
    }

    fn timer(id: u64, pop: u32, view: &str) -> Timer {
        Timer::at(TimerId::new(id), Time::from_millis(pop), ViewId::new(view))
    }

    #[test]
    fn dispatches_due_timer_with_bumped_sequence() {
        init_test("dispatches_due_timer_with_bumped_sequence");
        let (_clock, rx, handler) = handler_at(1_000, "v1");

        // Already overdue on the virtual clock, so the driver pops it on its
        // next pass regardless of real time.
        handler.add_timer(timer(1, 500, "v1"));

        let delivered = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer dispatched");
        crate::assert_with_log!(
            delivered.id == TimerId::new(1),
            "dispatched id",
            TimerId::new(1),
            delivered.id
        );
        crate::assert_with_log!(
            delivered.sequence_number == 1,
            "sequence bumped before dispatch",
            1,
            delivered.sequence_number
        );
        assert!(handler.is_empty());
        crate::test_complete!("dispatches_due_timer_with_bumped_sequence");
    }

    #[test]
    fn tombstone_pops_without_callback() {
        init_test("tombstone_pops_without_callback");
        let (_clock, rx, handler) = handler_at(1_000, "v1");

        let mut dead = timer(1, 500, "v1");
        dead.tombstone = true;
        handler.add_timer(dead);
        handler.add_timer(timer(2, 600, "v1"));

        let delivered = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("live timer dispatched");
        crate::assert_with_log!(
            delivered.id == TimerId::new(2),
            "only the live timer is delivered",
            TimerId::new(2),
            delivered.id
        );
        assert!(rx.try_recv().is_err(), "tombstone must not reach the callback");
        assert!(handler.is_empty());
        crate::test_complete!("tombstone_pops_without_callback");
    }

    #[test]
    fn dispatch_applies_current_cluster_view() {
        init_test("dispatch_applies_current_cluster_view");
        let (_clock, rx, handler) = handler_at(1_000, "v2");

        let mut stale = timer(1, 500, "v1");
        stale.replicas = vec!["10.0.0.9:7253".into()];
        stale.replica_tracker = 1;
        handler.add_timer(stale);

        let delivered = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer dispatched");
        crate::assert_with_log!(
            delivered.cluster_view_id == ViewId::new("v2"),
            "view rewritten on dispatch",
            ViewId::new("v2"),
            delivered.cluster_view_id
        );
        assert_eq!(delivered.replicas, vec!["10.0.0.1:7253".to_string()]);
        assert_eq!(delivered.replica_tracker, 0);
        crate::test_complete!("dispatch_applies_current_cluster_view");
    }

    #[test]
    fn replacement_across_views_keeps_information_timer() {
        init_test("replacement_across_views_keeps_information_timer");
        let (_clock, _rx, handler) = handler_at(1_000, "v2");

        // Far enough out that the driver will not pop it underneath us.
        handler.add_timer(timer(1, 900_000, "v1"));
        handler.add_timer(timer(1, 950_000, "v2"));

        let pair = handler.fetch(TimerId::new(1)).expect("stored pair");
        crate::assert_with_log!(
            pair.information.is_some(),
            "old view copy retained",
            true,
            pair.information.is_some()
        );
        let information = pair.information.expect("information timer");
        assert_eq!(information.cluster_view_id, ViewId::new("v1"));
        assert_eq!(pair.active.cluster_view_id, ViewId::new("v2"));
        crate::test_complete!("replacement_across_views_keeps_information_timer");
    }

    #[test]
    fn fetch_cancels_a_pending_timer() {
        init_test("fetch_cancels_a_pending_timer");
        let (clock, rx, handler) = handler_at(0, "v1");

        handler.add_timer(timer(1, 5_000, "v1"));
        let pair = handler.fetch(TimerId::new(1)).expect("pending pair");
        assert_eq!(pair.id(), TimerId::new(1));
        assert!(handler.fetch(TimerId::new(1)).is_none());

        clock.advance(10_000);
        assert!(
            rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "cancelled timer must not pop"
        );
        crate::test_complete!("fetch_cancels_a_pending_timer");
    }

    #[test]
    fn rebalance_pull_goes_through_the_handler() {
        init_test("rebalance_pull_goes_through_the_handler");
        let (_clock, _rx, handler) = handler_at(0, "v2");

        let mut stale = timer(1, 900_000, "v1");
        stale.replicas = vec!["node-a".into()];
        handler.add_timer(stale);

        let (status, body) = handler.get_timers_for_node("node-a", 10, &ViewId::new("v2"));
        assert_eq!(status, GetTimersStatus::Complete);
        let parsed: serde_json::Value = serde_json::from_str(&body).expect("valid json");
        assert_eq!(parsed["timers"].as_array().expect("timers array").len(), 1);

        assert!(handler.update_replica_tracker(TimerId::new(1), 0));
        assert!(!handler.update_replica_tracker(TimerId::new(9), 0));
        crate::test_complete!("rebalance_pull_goes_through_the_handler");
    }

    #[test]
    fn shutdown_drops_pending_timers_without_dispatch() {
        init_test("shutdown_drops_pending_timers_without_dispatch");
        let (_clock, rx, mut handler) = handler_at(0, "v1");

        handler.add_timer(timer(1, 600_000, "v1"));
        handler.shutdown();
        handler.shutdown();

        assert!(rx.try_recv().is_err(), "nothing dispatched after shutdown");
        crate::test_complete!("shutdown_drops_pending_timers_without_dispatch");
    }
}
