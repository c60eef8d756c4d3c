//! Allocator tests
//!
//! Exercises the segregated-fit allocation paths, block invariants and the
//! structural integrity of regions and free queues.

use pmr_mem::{ALIGN, AllocFlags, Configuration, Heap, MAX_BLOCK, Result};
use std::sync::Arc;

fn quiet_heap() -> Arc<Heap> {
    Heap::with_config(Configuration {
        enabled: false,
        ..Configuration::default()
    })
}

#[test_log::test]
fn alignment_and_size() -> Result<()> {
    let heap = quiet_heap();
    for request in [1usize, 7, 16, 17, 63, 64, 255, 1024, 4095, 16 * 1024] {
        let ptr = heap.alloc(request, AllocFlags::empty())?;
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0, "request {request}");
        assert!(heap.block_size(ptr.as_ptr()) >= request, "request {request}");
    }
    heap.verify_integrity(false);
    Ok(())
}

#[test_log::test]
fn zeroed_allocation() -> Result<()> {
    let heap = quiet_heap();
    // Dirty a block, lose it, then check a zeroed allocation really is zeroed
    let dirty = heap.alloc(512, AllocFlags::empty())?;
    // Safety: freshly allocated payload of at least 512 bytes.
    unsafe {
        dirty.as_ptr().write_bytes(0xAB, 512);
    }
    let ptr = heap.alloc(512, AllocFlags::ZERO)?;
    // Safety: freshly allocated payload of at least 512 bytes.
    unsafe {
        for offset in 0..512 {
            assert_eq!(*ptr.as_ptr().add(offset), 0, "offset {offset}");
        }
    }
    Ok(())
}

#[test_log::test]
fn data_integrity() -> Result<()> {
    let heap = quiet_heap();
    let mut blocks = Vec::new();
    for index in 0..100usize {
        let size = 16 + index * 8;
        let ptr = heap.alloc(size, AllocFlags::empty())?;
        // Safety: payload is at least `size` bytes.
        unsafe {
            ptr.as_ptr().write_bytes((index % 251) as u8, size);
        }
        blocks.push((ptr, size, (index % 251) as u8));
    }
    for (ptr, size, fill) in blocks {
        // Safety: the heap is not collecting; the blocks are still live.
        unsafe {
            for offset in 0..size {
                assert_eq!(*ptr.as_ptr().add(offset), fill);
            }
        }
    }
    heap.verify_integrity(false);
    Ok(())
}

#[test_log::test]
fn realloc_grows_and_preserves() -> Result<()> {
    let heap = quiet_heap();
    let ptr = heap.alloc(64, AllocFlags::ZERO)?;
    // Safety: payload is at least 64 bytes.
    unsafe {
        ptr.as_ptr().write_bytes(0x5A, 64);
    }
    let grown = heap.realloc(ptr, 4096)?;
    assert!(heap.block_size(grown.as_ptr()) >= 4096);
    // Safety: the grown payload is at least 4096 bytes.
    unsafe {
        for offset in 0..64 {
            assert_eq!(*grown.as_ptr().add(offset), 0x5A);
        }
        // Extension is zeroed
        assert_eq!(*grown.as_ptr().add(heap.block_size(ptr.as_ptr())), 0);
    }
    Ok(())
}

#[test_log::test]
fn realloc_shrink_is_identity() -> Result<()> {
    let heap = quiet_heap();
    let ptr = heap.alloc(1024, AllocFlags::empty())?;
    let same = heap.realloc(ptr, 100)?;
    assert_eq!(ptr.as_ptr(), same.as_ptr());
    Ok(())
}

#[test_log::test]
fn memdup_copies() -> Result<()> {
    let heap = quiet_heap();
    let data = b"the quick brown fox jumps over the lazy dog";
    let copy = heap.memdup(data)?;
    // Safety: memdup allocated at least data.len() bytes.
    let copied = unsafe { std::slice::from_raw_parts(copy.as_ptr(), data.len()) };
    assert_eq!(copied, data);
    Ok(())
}

#[test_log::test]
fn oversize_gets_its_own_region() -> Result<()> {
    let heap = quiet_heap();
    let before = heap.statistics().bytes_allocated;
    let ptr = heap.alloc(MAX_BLOCK + 4096, AllocFlags::ZERO)?;
    assert!(heap.block_size(ptr.as_ptr()) >= MAX_BLOCK + 4096);
    let after = heap.statistics().bytes_allocated;
    assert!(after > before + MAX_BLOCK);
    heap.verify_integrity(false);
    Ok(())
}

#[test_log::test]
fn many_sizes_keep_queues_consistent() -> Result<()> {
    let heap = quiet_heap();
    let mut sizes = Vec::new();
    let mut size = 24usize;
    while size < 100_000 {
        sizes.push(size);
        size = size * 17 / 10;
    }
    for &request in sizes.iter().cycle().take(500) {
        let _ = heap.alloc(request, AllocFlags::empty())?;
    }
    heap.verify_integrity(false);
    let stats = heap.statistics();
    assert!(stats.requests >= 500);
    Ok(())
}

#[test_log::test]
fn palloc_is_held() -> Result<()> {
    let heap = quiet_heap();
    let ptr = heap.palloc(256)?;
    assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
    heap.pfree(ptr.as_ptr());
    Ok(())
}

#[test_log::test]
fn disabled_collector_never_runs() -> Result<()> {
    let heap = quiet_heap();
    heap.start();
    for _ in 0..100 {
        let _ = heap.alloc(1024, AllocFlags::empty())?;
    }
    heap.request_gc(pmr_mem::GcFlags::FORCE | pmr_mem::GcFlags::NO_BLOCK);
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(heap.statistics().collections, 0);
    Ok(())
}

#[test_log::test]
fn statistics_track_requests() -> Result<()> {
    let heap = quiet_heap();
    let before = heap.statistics().requests;
    for _ in 0..10 {
        let _ = heap.alloc(128, AllocFlags::empty())?;
    }
    let stats = heap.statistics();
    assert!(stats.requests >= before + 10);
    assert!(stats.bytes_allocated > 0);
    Ok(())
}
