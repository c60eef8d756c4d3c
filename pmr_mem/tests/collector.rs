//! Collector tests
//!
//! Exercises hold/release, root reachability through manager callbacks,
//! finalizers and the cooperative cycle machinery.

use pmr_mem::{
    AllocFlags, Configuration, GcFlags, Heap, ManageEvent, Result,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

fn gc_heap() -> Arc<Heap> {
    let heap = Heap::with_config(Configuration::default());
    heap.start();
    heap
}

#[test_log::test]
fn hold_survives_collection() -> Result<()> {
    let heap = gc_heap();
    let ptr = heap.alloc(256, AllocFlags::ZERO)?;
    // Safety: freshly allocated payload of 256 bytes.
    unsafe {
        for offset in 0..256 {
            *ptr.as_ptr().add(offset) = (offset % 256) as u8;
        }
    }
    heap.hold(ptr.as_ptr());

    for _ in 0..3 {
        heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    }

    // Safety: the block is held, so no cycle may have freed it.
    unsafe {
        for offset in 0..256 {
            assert_eq!(*ptr.as_ptr().add(offset), (offset % 256) as u8);
        }
    }
    heap.release(ptr.as_ptr());
    Ok(())
}

#[test_log::test]
fn unrooted_blocks_are_swept() -> Result<()> {
    let heap = gc_heap();
    for _ in 0..200 {
        let _ = heap.alloc(128, AllocFlags::empty())?;
    }
    let before = heap.statistics().swept;
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    let stats = heap.statistics();
    assert!(stats.swept > before, "garbage should have been swept");
    assert!(stats.collections >= 1);
    Ok(())
}

fn mark_first_word(ptr: *mut u8, heap: &Heap, event: ManageEvent) {
    if event == ManageEvent::Mark {
        // Safety: the payload's first word holds the child payload address.
        let child = unsafe { ptr.cast::<usize>().read() };
        heap.mark_ptr(child as *const u8);
    }
}

#[test_log::test]
fn rooted_graph_survives() -> Result<()> {
    let heap = gc_heap();

    let child = heap.alloc(64, AllocFlags::ZERO)?;
    // Safety: fresh 64-byte payload.
    unsafe {
        child.as_ptr().write_bytes(0x77, 64);
    }
    let parent = heap.alloc_obj(64, mark_first_word)?;
    // Safety: fresh managed payload; first word records the child pointer.
    unsafe {
        parent.as_ptr().cast::<usize>().write(child.as_ptr() as usize);
    }
    heap.add_root(parent.as_ptr());

    for _ in 0..2 {
        heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    }

    // Safety: parent is rooted and the manager marks the child each cycle.
    unsafe {
        assert_eq!(parent.as_ptr().cast::<usize>().read(), child.as_ptr() as usize);
        for offset in 0..64 {
            assert_eq!(*child.as_ptr().add(offset), 0x77);
        }
    }
    heap.remove_root(parent.as_ptr());
    Ok(())
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn counting_finalizer(_ptr: *mut u8, _heap: &Heap, event: ManageEvent) {
    if event == ManageEvent::Free {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test_log::test]
fn finalizer_runs_once() -> Result<()> {
    let heap = gc_heap();
    let _garbage = heap.alloc_obj(64, counting_finalizer)?;
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    let after_first = FINALIZED.load(Ordering::SeqCst);
    assert_eq!(after_first, 1, "finalizer should run during the first sweep");
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    assert_eq!(
        FINALIZED.load(Ordering::SeqCst),
        after_first,
        "finalizer must not run twice"
    );
    Ok(())
}

#[test_log::test]
fn collection_aborts_when_a_thread_refuses_to_yield() -> Result<()> {
    let heap = Heap::with_config(Configuration {
        gc_sync_timeout: Duration::from_millis(50),
        ..Configuration::default()
    });
    heap.start();

    let stop = Arc::new(AtomicBool::new(false));
    let worker_heap = Arc::clone(&heap);
    let worker_stop = Arc::clone(&stop);
    let worker = thread::spawn(move || {
        worker_heap.register_thread();
        while !worker_stop.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(5));
        }
        worker_heap.deregister_thread();
    });

    thread::sleep(Duration::from_millis(20));
    heap.request_gc(GcFlags::FORCE | GcFlags::NO_BLOCK);
    thread::sleep(Duration::from_millis(200));
    assert!(
        heap.statistics().aborted_collections >= 1,
        "cycle should abort while a registered thread never yields"
    );

    stop.store(true, Ordering::Release);
    worker.join().expect("worker");
    Ok(())
}

#[test_log::test]
fn alloc_hold_collect_scenario() -> Result<()> {
    let heap = gc_heap();
    let mut held = Vec::new();
    for index in 0..10_000usize {
        let ptr = heap.alloc(64, AllocFlags::ZERO)?;
        // Safety: fresh 64-byte payload.
        unsafe {
            ptr.as_ptr().write_bytes((index % 251) as u8, 64);
        }
        if index % 10 == 0 {
            heap.hold(ptr.as_ptr());
            held.push((ptr, (index % 251) as u8));
        }
    }
    assert_eq!(held.len(), 1_000);

    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);

    let stats = heap.statistics();
    assert!(stats.collections >= 1);
    assert!(stats.swept >= 5_000, "bulk of the garbage should be swept");
    // Safety: held blocks are immune to collection.
    unsafe {
        for (ptr, fill) in &held {
            for offset in 0..64 {
                assert_eq!(*ptr.as_ptr().add(offset), *fill);
            }
        }
    }
    for (ptr, _) in &held {
        heap.release(ptr.as_ptr());
    }
    Ok(())
}

#[test_log::test]
fn sweep_coalesces_adjacent_garbage() -> Result<()> {
    let heap = Heap::with_config(Configuration {
        // Force aggressive joining from the first sweep
        cache_heap: 1,
        ..Configuration::default()
    });
    heap.start();

    let mut keep = Vec::new();
    for index in 0..500usize {
        let ptr = heap.alloc(96, AllocFlags::empty())?;
        if index % 50 == 0 {
            heap.hold(ptr.as_ptr());
            keep.push(ptr);
        }
    }
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    heap.verify_integrity(true);
    assert!(heap.statistics().joins > 0, "adjacent garbage should coalesce");
    for ptr in keep {
        heap.release(ptr.as_ptr());
    }
    Ok(())
}

#[test_log::test]
fn enable_gc_returns_previous_setting() {
    let heap = gc_heap();
    assert!(heap.enable_gc(false));
    assert!(!heap.enable_gc(true));
}

#[test_log::test]
fn released_blocks_become_collectable() -> Result<()> {
    let heap = gc_heap();
    let ptr = heap.alloc(512, AllocFlags::empty())?;
    heap.hold(ptr.as_ptr());
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    let before = heap.statistics().freed;

    heap.release(ptr.as_ptr());
    heap.request_gc(GcFlags::FORCE | GcFlags::COMPLETE);
    assert!(
        heap.statistics().freed > before,
        "released block should be reclaimed by the next cycle"
    );
    Ok(())
}
