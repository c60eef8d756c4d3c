//! Dispatcher lifecycle and synchronous wait tests.

use pmr_dispatch::{Error, EventFlags, EventService, ServiceFlags};
use pmr_mem::{Configuration, GcFlags, Heap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn service() -> Arc<EventService> {
    let heap = Heap::with_config(Configuration {
        enabled: false,
        ..Configuration::default()
    });
    EventService::new(heap)
}

#[test_log::test]
fn wait_for_event_times_out() {
    let service = service();
    let dispatcher = service.create_dispatcher("quiet").expect("dispatcher");
    let start = Instant::now();
    let result = dispatcher.wait_for_event(Duration::from_millis(50));
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test_log::test]
fn wait_for_event_returns_on_signal() {
    let service = service();
    let dispatcher = service.create_dispatcher("signalled").expect("dispatcher");

    let signaller = Arc::clone(&dispatcher);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        signaller.signal();
    });
    let result = dispatcher.wait_for_event(Duration::from_secs(5));
    assert!(result.is_ok());
    handle.join().expect("signaller");
}

#[test_log::test]
fn wait_for_event_dispatches_due_events() {
    let service = service();
    let dispatcher = service.create_dispatcher("due").expect("dispatcher");
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    dispatcher.create_event("soon", 10, EventFlags::empty(), move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let result = dispatcher.wait_for_event(Duration::from_secs(5));
    assert!(result.is_ok());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test_log::test]
fn disabled_dispatcher_does_not_run_events() {
    let service = service();
    let dispatcher = service.create_dispatcher("disabled").expect("dispatcher");
    let runs = Arc::new(AtomicUsize::new(0));

    dispatcher.disable();
    let counter = Arc::clone(&runs);
    dispatcher.create_event("never", 0, EventFlags::empty(), move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    service.service_events(Some(Duration::from_millis(100)), ServiceFlags::empty());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // Re-enabling releases queued work
    dispatcher.enable();
    let counter = Arc::clone(&runs);
    dispatcher.create_event("now", 0, EventFlags::empty(), move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    service.service_events(Some(Duration::from_millis(100)), ServiceFlags::empty());
    assert!(runs.load(Ordering::SeqCst) >= 1);
}

#[test_log::test]
fn destroyed_dispatcher_is_invalidated() {
    let service = service();
    let dispatcher = service.create_dispatcher("doomed").expect("dispatcher");
    let runs = Arc::new(AtomicUsize::new(0));

    dispatcher.destroy();
    assert!(dispatcher.is_destroyed());

    let counter = Arc::clone(&runs);
    dispatcher.create_event("ghost", 0, EventFlags::empty(), move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    service.service_events(Some(Duration::from_millis(100)), ServiceFlags::empty());
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test_log::test]
fn disable_drains_queued_events() {
    let service = service();
    let dispatcher = service.create_dispatcher("drained").expect("dispatcher");
    dispatcher.create_event("pending", 5_000, EventFlags::empty(), |_event| {});
    assert!(dispatcher.has_events());
    dispatcher.disable();
    assert!(!dispatcher.has_events());
    let _ = service;
}

#[test_log::test]
fn relay_event_runs_inline() {
    let service = service();
    let dispatcher = service.create_dispatcher("relay").expect("dispatcher");
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&ran);
    dispatcher.relay_event(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test_log::test]
fn idle_workers_do_not_block_collection() {
    let heap = Heap::with_config(Configuration::default());
    heap.start();
    let service = EventService::new(Arc::clone(&heap));
    let dispatcher = service.create_dispatcher("gc-friendly").expect("dispatcher");
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    dispatcher.create_event("work", 0, EventFlags::empty(), move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    service.service_events(Some(Duration::from_millis(150)), ServiceFlags::empty());
    assert!(runs.load(Ordering::SeqCst) >= 1);

    // The worker that ran the event is now parked sticky-yielded; a forced
    // collection must complete without it waking.
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    assert!(heap.statistics().collections >= 1);
}
