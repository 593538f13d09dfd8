//! End-to-end driver tests against the real monotonic clock.
//!
//! These run the full stack (store, driver thread, callback) with real
//! sleeps, so deadlines are generous. Tick-level timing is covered by the
//! deterministic virtual-clock tests.

use knell::clock::{Clock, MonotonicClock};
use knell::config::WheelConfig;
use knell::handler::{Callback, TimerHandler};
use knell::store::{NullHealthSink, TimerStore};
use knell::test_utils::init_test_logging;
use knell::timer::{ClusterView, Timer};
use knell::types::{TimerId, ViewId};
use knell::{assert_with_log, test_complete, test_phase};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

struct ChannelCallback(mpsc::Sender<Timer>);

impl Callback for ChannelCallback {
    fn perform(&self, timer: Timer) {
        let _ = self.0.send(timer);
    }
}

fn real_time_handler(view: &str) -> (Arc<MonotonicClock>, mpsc::Receiver<Timer>, TimerHandler) {
    let clock = Arc::new(MonotonicClock::new());
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

#[test]
fn timers_fire_in_pop_order() {
    init_test_logging();
    test_phase!("timers_fire_in_pop_order");

    let (clock, rx, handler) = real_time_handler("v1");
    let now = clock.now();

    // Distinct ticks, so the delivery order across batches is guaranteed.
    for (id, delay) in [(3u64, 90u32), (1, 30), (2, 60)] {
        let timer = Timer::from_delay(TimerId::new(id), now, delay, ViewId::new("v1"))
            .expect("representable delay");
        handler.add_timer(timer);
    }

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let timer = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("timer dispatched");
        delivered.push(timer.id.as_u64());
    }
    assert_with_log!(
        delivered == vec![1, 2, 3],
        "delivery follows pop order",
        vec![1u64, 2, 3],
        delivered
    );
    assert!(handler.is_empty());
    test_complete!("timers_fire_in_pop_order");
}

#[test]
fn tombstone_never_reaches_the_callback() {
    init_test_logging();
    test_phase!("tombstone_never_reaches_the_callback");

    let (clock, rx, handler) = real_time_handler("v1");
    let now = clock.now();

    let mut dead = Timer::from_delay(TimerId::new(1), now, 20, ViewId::new("v1"))
        .expect("representable delay");
    dead.tombstone = true;
    handler.add_timer(dead);
    let live = Timer::from_delay(TimerId::new(2), now, 50, ViewId::new("v1"))
        .expect("representable delay");
    handler.add_timer(live);

    let delivered = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("live timer dispatched");
    assert_with_log!(
        delivered.id == TimerId::new(2),
        "only the live timer arrives",
        TimerId::new(2),
        delivered.id
    );
    assert!(
        rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "tombstone was dispatched"
    );
    test_complete!("tombstone_never_reaches_the_callback");
}

#[test]
fn insert_wakes_an_idle_driver() {
    init_test_logging();
    test_phase!("insert_wakes_an_idle_driver");

    let (clock, rx, handler) = real_time_handler("v1");

    // Park the driver against a distant timer, then add a near one.
    let now = clock.now();
    handler.add_timer(
        Timer::from_delay(TimerId::new(1), now, 60_000, ViewId::new("v1"))
            .expect("representable delay"),
    );
    std::thread::sleep(Duration::from_millis(30));

    let now = clock.now();
    handler.add_timer(
        Timer::from_delay(TimerId::new(2), now, 20, ViewId::new("v1"))
            .expect("representable delay"),
    );

    let delivered = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("near timer dispatched");
    assert_with_log!(
        delivered.id == TimerId::new(2),
        "near timer fires first",
        TimerId::new(2),
        delivered.id
    );
    assert_eq!(handler.len(), 1);
    test_complete!("insert_wakes_an_idle_driver");
}
