//! The heap: regions, free queues, allocation paths and limit enforcement.
//!
//! The allocator is deterministic and O(1): requests map to a size-class queue,
//! the bitmap scan finds the first non-empty queue of sufficient size, and the
//! block is detached under that queue's try-lock. The sweeper races with all of
//! this and the shared state is confined to the packed header word, the queue
//! lists behind their locks, and the bitmap words.

use crate::block::{
    ALIGN, BlockHeader, HEADER_SIZE, MANAGER_SLOT, MAX_BLOCK, MIN_BLOCK, MIN_SPLIT, ManageEvent,
    ManagerFn, Region, REGION_HEADER, align_up, header_of, manager_of, next_block, payload,
    set_manager, usable_size,
};
use crate::config::{Configuration, MemCause, MemNotifier, MemoryPolicy, Statistics};
use crate::cond::Cond;
use crate::error::{Error, Result};
use crate::queue::{BITMAP_BITS, FreeQueue, NUM_BITMAPS, NUM_QUEUES, pop_front, push_front, size_to_queue};
use crate::roots::RootSet;
use crate::threads::{ThreadService, YieldFlags};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Largest representable allocation. Bounded by the size field of the header.
pub(crate) const ALLOC_MAX: usize = 1 << 40;

/// Byte written over freed payloads when `PMR_SCRIBBLE_MEM` is enabled.
pub(crate) const SCRIBBLE_BYTE: u8 = 0xFE;

bitflags! {
    /// Flags for [`Heap::alloc`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// Zero the returned payload
        const ZERO = 0x1;
        /// Reserve a manager slot in the block tail
        const MANAGER = 0x2;
    }
}

bitflags! {
    /// Flags for [`Heap::request_gc`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct GcFlags: u32 {
        /// Collect whether or not the work quota has been reached
        const FORCE = 0x1;
        /// Block until the sweep completes as well
        const COMPLETE = 0x2;
        /// Do not yield or block after requesting
        const NO_BLOCK = 0x4;
    }
}

/// Global heap instance
pub static HEAP: LazyLock<Arc<Heap>> = LazyLock::new(|| {
    let heap = Heap::new();
    heap.start();
    heap
});

/// Returns the process-wide heap.
#[must_use]
pub fn heap() -> &'static Arc<Heap> {
    &HEAP
}

pub(crate) struct HeapStats {
    pub bytes_allocated: AtomicUsize,
    pub bytes_free: AtomicUsize,
    pub requests: AtomicUsize,
    pub reuse: AtomicUsize,
    pub splits: AtomicUsize,
    pub joins: AtomicUsize,
    pub unpins: AtomicUsize,
    pub retries: AtomicUsize,
    pub try_fails: AtomicUsize,
    pub collections: AtomicUsize,
    pub aborted_collections: AtomicUsize,
    pub swept: AtomicUsize,
    pub freed: AtomicUsize,
}

impl HeapStats {
    fn new() -> Self {
        Self {
            bytes_allocated: AtomicUsize::new(0),
            bytes_free: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            reuse: AtomicUsize::new(0),
            splits: AtomicUsize::new(0),
            joins: AtomicUsize::new(0),
            unpins: AtomicUsize::new(0),
            retries: AtomicUsize::new(0),
            try_fails: AtomicUsize::new(0),
            collections: AtomicUsize::new(0),
            aborted_collections: AtomicUsize::new(0),
            swept: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        }
    }
}

/// Arena-backed segregated-fit heap with a cooperative mark-sweep collector.
pub struct Heap {
    pub(crate) this: Weak<Heap>,
    pub(crate) config: Configuration,
    pub(crate) regions: AtomicPtr<Region>,
    pub(crate) queues: Vec<FreeQueue>,
    pub(crate) bitmaps: [AtomicU64; NUM_BITMAPS],
    pub(crate) stats: HeapStats,
    pub(crate) roots: RootSet,
    pub(crate) threads: ThreadService,

    // Generation mark toggled each cycle
    pub(crate) active_mark: AtomicBool,
    pub(crate) enabled: AtomicBool,
    pub(crate) gc_requested: AtomicBool,
    pub(crate) must_yield: AtomicBool,
    pub(crate) marking: AtomicBool,
    pub(crate) sweeping: AtomicBool,
    pub(crate) pause_count: AtomicUsize,
    pub(crate) work_done: AtomicUsize,

    // Limits, mutable through setters
    pub(crate) warn_heap: AtomicUsize,
    pub(crate) max_heap: AtomicUsize,
    pub(crate) cache_heap: AtomicUsize,
    pub(crate) low_heap: AtomicUsize,
    policy: AtomicU8,
    notifier: Mutex<Option<MemNotifier>>,
    pub(crate) has_error: AtomicBool,

    // Collector thread coordination
    pub(crate) gc_cond: Cond,
    pub(crate) shutdown: AtomicBool,
    collector_thread: Mutex<Option<JoinHandle<()>>>,

    pub(crate) page_size: usize,
    pub(crate) scribble: bool,
    pub(crate) verify: bool,
    pub(crate) track: bool,
}

// Safety: the raw region pointer chain is only mutated via CAS (growers) and by
// the single sweeper thread; all other shared state is atomics or behind locks.
unsafe impl Send for Heap {}
// Safety: as above; &Heap exposes no unsynchronized interior mutability.
unsafe impl Sync for Heap {}

fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|value| value == "1")
}

impl Heap {
    /// Creates a heap with the default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(Configuration::default())
    }

    /// Creates a heap with a custom configuration. Limits left at `0` are
    /// derived from system memory.
    #[must_use]
    pub fn with_config(mut config: Configuration) -> Arc<Self> {
        if env_flag("PMR_DISABLE_GC") {
            config.enabled = false;
        }
        let page_size = page_size();
        config.region_size = align_up(config.region_size.max(page_size));

        let system_memory = system_memory_bytes();
        let warn_heap = if config.warn_heap > 0 {
            config.warn_heap
        } else {
            system_memory / 10 * 9
        };
        let max_heap = if config.max_heap > 0 { config.max_heap } else { usize::MAX };
        let cache_heap = if config.cache_heap > 0 {
            config.cache_heap
        } else {
            config.region_size * 4
        };
        let low_heap = if config.low_heap > 0 { config.low_heap } else { config.region_size };

        let queues: Vec<FreeQueue> = (0..NUM_QUEUES).map(FreeQueue::new).collect();
        let enabled = config.enabled;

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            regions: AtomicPtr::new(ptr::null_mut()),
            queues,
            bitmaps: std::array::from_fn(|_| AtomicU64::new(0)),
            stats: HeapStats::new(),
            roots: RootSet::new(),
            threads: ThreadService::new(),
            active_mark: AtomicBool::new(false),
            enabled: AtomicBool::new(enabled),
            gc_requested: AtomicBool::new(false),
            must_yield: AtomicBool::new(false),
            marking: AtomicBool::new(false),
            sweeping: AtomicBool::new(false),
            pause_count: AtomicUsize::new(0),
            work_done: AtomicUsize::new(0),
            warn_heap: AtomicUsize::new(warn_heap),
            max_heap: AtomicUsize::new(max_heap),
            cache_heap: AtomicUsize::new(cache_heap),
            low_heap: AtomicUsize::new(low_heap),
            policy: AtomicU8::new(0),
            notifier: Mutex::new(None),
            has_error: AtomicBool::new(false),
            gc_cond: Cond::new(),
            shutdown: AtomicBool::new(false),
            collector_thread: Mutex::new(None),
            page_size,
            scribble: env_flag("PMR_SCRIBBLE_MEM"),
            verify: env_flag("PMR_VERIFY_MEM"),
            track: env_flag("PMR_TRACK_MEM"),
        })
    }

    /// Starts the background collector thread.
    pub fn start(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let mut collector_thread = self.collector_thread.lock();
        if collector_thread.is_some() {
            return;
        }
        let Some(heap) = self.this.upgrade() else {
            return;
        };
        match std::thread::Builder::new()
            .name("pmr-gc".to_string())
            .spawn(move || heap.collector_main())
        {
            Ok(handle) => {
                *collector_thread = Some(handle);
                debug!("collector started");
            }
            Err(error) => {
                self.has_error.store(true, Ordering::Release);
                tracing::error!("cannot create collector thread: {error}");
            }
        }
    }

    /// Stops the collector thread and joins it.
    pub fn stop(&self) {
        let handle = self.collector_thread.lock().take();
        if let Some(handle) = handle {
            self.shutdown.store(true, Ordering::Release);
            self.gc_cond.signal();
            if handle.join().is_err() {
                warn!("collector thread panicked during shutdown");
            }
            debug!("collector stopped");
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `usize_req` bytes. The returned pointer is 16-byte aligned and
    /// the payload is at least `usize_req` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the request exceeds the internal maximum or the OS
    /// refuses memory (in which case the failure policy has already run).
    #[track_caller]
    pub fn alloc(&self, usize_req: usize, flags: AllocFlags) -> Result<NonNull<u8>> {
        let tail = if flags.contains(AllocFlags::MANAGER) { MANAGER_SLOT } else { 0 };
        let size = align_up((usize_req + HEADER_SIZE + tail).max(MIN_BLOCK));
        let mp = self.alloc_mem(size)?;
        // Safety: alloc_mem returns a live, exclusively owned block.
        unsafe {
            if flags.contains(AllocFlags::MANAGER) {
                (*mp).set_has_manager(true);
                set_manager(mp, manager_none);
            }
            if self.track {
                (*mp).set_site(site_hash(std::panic::Location::caller()));
            }
            let ptr = payload(mp);
            if flags.contains(AllocFlags::ZERO) && !(*mp).is_full_region() {
                // Full regions come zeroed from the OS
                ptr.write_bytes(0, usable_size(mp));
            }
            Ok(NonNull::new_unchecked(ptr))
        }
    }

    /// Allocates a zeroed, managed block and installs its manager callback.
    ///
    /// # Errors
    ///
    /// See [`Heap::alloc`].
    #[track_caller]
    pub fn alloc_obj(&self, usize_req: usize, manager: ManagerFn) -> Result<NonNull<u8>> {
        let ptr = self.alloc(usize_req, AllocFlags::ZERO | AllocFlags::MANAGER)?;
        // Safety: the block was just allocated with a manager slot.
        unsafe {
            set_manager(header_of(ptr.as_ptr()), manager);
        }
        Ok(ptr)
    }

    /// Allocation fast path: no manager, no zeroing.
    ///
    /// # Errors
    ///
    /// See [`Heap::alloc`].
    pub fn alloc_fast(&self, usize_req: usize) -> Result<NonNull<u8>> {
        let size = align_up((usize_req + HEADER_SIZE).max(MIN_BLOCK));
        let mp = self.alloc_mem(size)?;
        // Safety: alloc_mem returns a live, exclusively owned block.
        unsafe { Ok(NonNull::new_unchecked(payload(mp))) }
    }

    /// Reallocates to at least `usize_req` bytes. Shrinking requests return the
    /// original pointer; growth allocates a new zero-extended block and leaves
    /// the old one for the collector.
    ///
    /// # Errors
    ///
    /// See [`Heap::alloc`].
    pub fn realloc(&self, ptr: NonNull<u8>, usize_req: usize) -> Result<NonNull<u8>> {
        // Safety: ptr was produced by this allocator.
        unsafe {
            let mp = header_of(ptr.as_ptr());
            self.check_block(mp);
            let old_usize = usable_size(mp);
            if usize_req <= old_usize {
                return Ok(ptr);
            }
            let has_manager = (*mp).has_manager();
            let flags = if has_manager { AllocFlags::MANAGER } else { AllocFlags::empty() };
            let newp = self.alloc(usize_req, flags)?;
            let newb = header_of(newp.as_ptr());
            if has_manager {
                if let Some(manager) = manager_of(mp) {
                    set_manager(newb, manager);
                }
            }
            ptr::copy_nonoverlapping(ptr.as_ptr(), newp.as_ptr(), old_usize);
            newp.as_ptr()
                .add(old_usize)
                .write_bytes(0, usable_size(newb) - old_usize);
            if (*mp).is_eternal() {
                // Transfer the hold to the replacement
                (*newb).set_eternal(true);
                (*mp).set_eternal(false);
            }
            Ok(newp)
        }
    }

    /// Duplicates `data` into a new allocation.
    ///
    /// # Errors
    ///
    /// See [`Heap::alloc`].
    pub fn memdup(&self, data: &[u8]) -> Result<NonNull<u8>> {
        let ptr = self.alloc(data.len(), AllocFlags::empty())?;
        // Safety: the fresh payload is at least data.len() bytes.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
        Ok(ptr)
    }

    /// Permanent allocation: allocated zeroed and held.
    ///
    /// # Errors
    ///
    /// See [`Heap::alloc`].
    pub fn palloc(&self, usize_req: usize) -> Result<NonNull<u8>> {
        let ptr = self.alloc(usize_req, AllocFlags::ZERO)?;
        self.hold(ptr.as_ptr());
        Ok(ptr)
    }

    /// Releases a permanent allocation back to collector control.
    pub fn pfree(&self, ptr: *const u8) {
        self.release(ptr);
    }

    /// Usable payload size of an allocation.
    #[must_use]
    pub fn block_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // Safety: ptr was produced by this allocator.
        unsafe { usable_size(header_of(ptr)) }
    }

    /// Good-fit search across the free queues, falling back to heap growth.
    fn alloc_mem(&self, required: usize) -> Result<*mut BlockHeader> {
        // Every allocating thread participates in the yield protocol; an
        // unregistered thread would let the collector pause underneath it.
        let _ = self.threads.current();
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        debug_assert!(!self.marking.load(Ordering::Acquire));

        let mut target = size_to_queue(required);
        if let Some(qindex) = target {
            // Good-fit: if the request exceeds the queue's smallest size, only the
            // next queue up guarantees a large enough block.
            if required > self.queues[qindex].min_size {
                target = if qindex + 1 >= NUM_QUEUES { None } else { Some(qindex + 1) };
            }
        }
        let Some(base) = target else {
            return self.grow_heap(required);
        };
        self.work_done.fetch_add(base, Ordering::Relaxed);

        let mut scan_from = base;
        let mut retried = false;
        loop {
            let mut retry_index = None;
            for bindex in scan_from / BITMAP_BITS..NUM_BITMAPS {
                let floor = scan_from.saturating_sub(bindex * BITMAP_BITS);
                if floor >= BITMAP_BITS {
                    continue;
                }
                let mut local =
                    self.bitmaps[bindex].load(Ordering::Acquire) & (u64::MAX << floor);
                while local != 0 {
                    let qindex = bindex * BITMAP_BITS + local.trailing_zeros() as usize;
                    if qindex >= NUM_QUEUES {
                        break;
                    }
                    let freeq = &self.queues[qindex];
                    if let Some(mut list) = freeq.list.try_lock() {
                        if list.count > 0 {
                            // Safety: the queue lock is held and the list is non-empty.
                            let mp = unsafe { pop_front(&mut list) };
                            if list.count == 0 {
                                self.clear_queue_bit(qindex);
                            }
                            // Safety: mp was detached under the lock; we own it now.
                            unsafe {
                                (*mp).set_allocated(self.active_mark.load(Ordering::Acquire));
                            }
                            drop(list);
                            // Safety: we own the block.
                            let size = unsafe { (*mp).size() };
                            self.stats.bytes_free.fetch_sub(size, Ordering::Relaxed);
                            self.stats.reuse.fetch_add(1, Ordering::Relaxed);
                            if size >= required + MIN_SPLIT {
                                // Safety: the spare range is exclusively ours until linked.
                                unsafe {
                                    let spare = mp.cast::<u8>().add(required).cast();
                                    self.link_spare_block(spare, size - required);
                                    (*mp).set_size(required);
                                }
                                self.stats.splits.fetch_add(1, Ordering::Relaxed);
                            }
                            self.maybe_trigger_gc();
                            return Ok(mp);
                        }
                        drop(list);
                    } else {
                        self.stats.try_fails.fetch_add(1, Ordering::Relaxed);
                        if retry_index.is_none() {
                            retry_index = Some(qindex);
                        }
                    }
                    // Refresh: other threads may have split or drained queues
                    let next_floor = (qindex + 1).saturating_sub(bindex * BITMAP_BITS);
                    if next_floor >= BITMAP_BITS {
                        break;
                    }
                    local =
                        self.bitmaps[bindex].load(Ordering::Acquire) & (u64::MAX << next_floor);
                }
            }
            // One bounded retry when a candidate queue was contended but held blocks
            match retry_index {
                Some(retry) if !retried => {
                    retried = true;
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    scan_from = retry;
                }
                _ => break,
            }
        }
        self.grow_heap(required)
    }

    /// Maps a fresh region and carves the request out of it.
    fn grow_heap(&self, required: usize) -> Result<*mut BlockHeader> {
        if required < MAX_BLOCK && self.work_done.load(Ordering::Relaxed) > self.config.work_quota
        {
            self.trigger_gc();
        }
        if required >= ALLOC_MAX {
            self.alloc_exception(MemCause::TooBig, required);
            return Err(Error::TooBig(required));
        }
        let size = page_align(
            (required + REGION_HEADER).max(self.config.region_size),
            self.page_size,
        );
        let base = self.virt_alloc(size)?;
        let region = base.cast::<Region>();
        // Safety: the mapping is fresh, zeroed and at least REGION_HEADER bytes.
        unsafe {
            (*region).size = size;
            (*region).freeable.store(false, Ordering::Release);
            let mp = Region::start(region);
            let mut block_size = required;
            let mut spare = size - required - REGION_HEADER;
            // Big blocks are not split so the whole region can be unpinned at once
            if spare < MIN_BLOCK || required >= MAX_BLOCK {
                block_size = size - REGION_HEADER;
                spare = 0;
            }
            (*mp).init(block_size, true);
            (*mp).set_mark(self.active_mark.load(Ordering::Acquire));
            if spare > 0 {
                self.link_spare_block(mp.cast::<u8>().add(block_size).cast(), spare);
            } else {
                (*mp).set_full_region(true);
            }
            // Publish the region; racing growers all prepend
            let mut head = self.regions.load(Ordering::Acquire);
            loop {
                (*region).next.store(head, Ordering::Release);
                match self.regions.compare_exchange_weak(
                    head,
                    region,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => head = current,
                }
            }
            self.stats.bytes_allocated.fetch_add(size, Ordering::Relaxed);
            Ok(mp)
        }
    }

    /// Links a block onto its size-class queue. Returns `false` if the queue was
    /// contended; the caller decides whether to retry or leave the block for the
    /// next sweep.
    ///
    /// # Safety
    /// `mp` must be a live, unqueued block owned by the caller.
    pub(crate) unsafe fn link_block(&self, mp: *mut BlockHeader) -> bool {
        // Safety: caller owns the block.
        let size = unsafe { (*mp).size() };
        let qindex = size_to_queue(size).expect("oversize blocks are never queued");
        let freeq = &self.queues[qindex];
        let Some(mut list) = freeq.list.try_lock() else {
            self.stats.try_fails.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        // Safety: the queue lock is held; the block becomes list property. The
        // bitmap bit is set with the lock held to keep it consistent with the list.
        unsafe {
            (*mp).set_free(qindex);
            push_front(&mut list, mp);
        }
        self.set_queue_bit(qindex);
        drop(list);
        self.stats.bytes_free.fetch_add(size, Ordering::Relaxed);
        true
    }

    /// Links spare memory produced by a split. Must not lose memory: on queue
    /// contention the spare is halved and the smaller piece retried.
    ///
    /// # Safety
    /// `[ptr, ptr+size)` must be exclusively owned, aligned spare space.
    pub(crate) unsafe fn link_spare_block(&self, ptr: *mut BlockHeader, size: usize) {
        debug_assert!(size >= MIN_BLOCK);
        let mut mp = ptr;
        let mut remaining = size;
        let mut len = clip_spare(remaining);
        while remaining > 0 {
            // Safety: the range is exclusively ours until linked.
            unsafe {
                (*mp).init(len, false);
                if !self.link_block(mp) {
                    if len >= MIN_BLOCK * 8 {
                        len = align_up(len / 2).min(remaining);
                    }
                    continue;
                }
                remaining -= len;
                mp = mp.cast::<u8>().add(len).cast();
                len = clip_spare(remaining);
            }
        }
    }

    fn set_queue_bit(&self, qindex: usize) {
        self.bitmaps[qindex / BITMAP_BITS]
            .fetch_or(1 << (qindex % BITMAP_BITS), Ordering::AcqRel);
    }

    fn clear_queue_bit(&self, qindex: usize) {
        self.bitmaps[qindex / BITMAP_BITS]
            .fetch_and(!(1 << (qindex % BITMAP_BITS)), Ordering::AcqRel);
    }

    fn maybe_trigger_gc(&self) {
        if self.work_done.load(Ordering::Relaxed) > self.config.work_quota
            && self.stats.bytes_free.load(Ordering::Relaxed)
                < self.low_heap.load(Ordering::Relaxed)
            && !self.gc_requested.load(Ordering::Acquire)
        {
            self.trigger_gc();
        }
    }

    // ------------------------------------------------------------------
    // Raw pages
    // ------------------------------------------------------------------

    /// Maps raw pages, enforcing the configured limits and red-lines.
    ///
    /// # Errors
    ///
    /// Returns an error when the OS refuses the mapping. Limit breaches invoke
    /// the failure policy first, which may not return.
    pub fn virt_alloc(&self, size: usize) -> Result<*mut u8> {
        let size = page_align(size, self.page_size);
        let used = self.stats.bytes_allocated.load(Ordering::Relaxed);
        let max_heap = self.max_heap.load(Ordering::Relaxed);
        if used.saturating_add(size) > max_heap {
            self.alloc_exception(MemCause::Limit, size);
        } else if used.saturating_add(size) > self.warn_heap.load(Ordering::Relaxed) {
            self.alloc_exception(MemCause::Warning, size);
        }
        // Safety: anonymous private mapping with no file descriptor.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            self.alloc_exception(MemCause::Fail, size);
            return Err(Error::Memory(size));
        }
        Ok(ptr.cast())
    }

    /// Unmaps pages previously returned by [`Heap::virt_alloc`].
    ///
    /// # Safety
    /// `ptr`/`size` must describe exactly one prior `virt_alloc` mapping.
    pub unsafe fn virt_free(&self, ptr: *mut u8, size: usize) {
        // Safety: per the contract above.
        unsafe {
            if libc::munmap(ptr.cast(), page_align(size, self.page_size)) != 0 {
                warn!("munmap of {size} bytes failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Hold / release / roots / marking
    // ------------------------------------------------------------------

    /// Makes a block immune to collection until [`Heap::release`]. Does not
    /// protect blocks referenced from the payload; use a root for that.
    pub fn hold(&self, ptr: *const u8) {
        if ptr.is_null() {
            return;
        }
        // Safety: ptr was produced by this allocator.
        unsafe {
            let mp = header_of(ptr);
            if !(*mp).is_free() {
                (*mp).set_eternal(true);
            }
        }
    }

    /// Restores collector control over a held block.
    pub fn release(&self, ptr: *const u8) {
        if ptr.is_null() {
            return;
        }
        // Safety: ptr was produced by this allocator.
        unsafe {
            let mp = header_of(ptr);
            if !(*mp).is_free() {
                (*mp).set_eternal(false);
            }
        }
    }

    /// Adds a pointer to the root set.
    pub fn add_root(&self, ptr: *const u8) {
        self.roots.add(ptr);
    }

    /// Removes a pointer from the root set.
    pub fn remove_root(&self, ptr: *const u8) {
        self.roots.remove(ptr);
    }

    /// Marks a block live for the current cycle and recurses through its
    /// manager. Called from manager callbacks during the mark phase.
    pub fn mark_ptr(&self, ptr: *const u8) {
        if ptr.is_null() {
            return;
        }
        let active = self.active_mark.load(Ordering::Acquire);
        // Safety: ptr was produced by this allocator; marking runs with mutators
        // yielded so the block cannot be freed underneath us.
        unsafe {
            let mp = header_of(ptr);
            if (*mp).is_free() {
                return;
            }
            if (*mp).try_mark(active) && (*mp).has_manager() {
                if let Some(manager) = manager_of(mp) {
                    manager(ptr.cast_mut(), self, ManageEvent::Mark);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Limits, policy, notifier
    // ------------------------------------------------------------------

    /// Sets the warn, max and cache limits. `0` leaves a limit unchanged.
    pub fn set_mem_limits(&self, warn: usize, max: usize, cache: usize) {
        if warn > 0 {
            self.warn_heap.store(warn, Ordering::Relaxed);
        }
        if max > 0 {
            self.max_heap.store(max, Ordering::Relaxed);
        }
        if cache > 0 {
            self.cache_heap.store(cache, Ordering::Relaxed);
        }
    }

    /// Sets the depletion policy.
    pub fn set_mem_policy(&self, policy: MemoryPolicy) {
        self.policy.store(policy_to_u8(policy), Ordering::Relaxed);
    }

    /// Current depletion policy.
    #[must_use]
    pub fn mem_policy(&self) -> MemoryPolicy {
        policy_from_u8(self.policy.load(Ordering::Relaxed))
    }

    /// Registers the memory notifier invoked on allocation exceptions.
    pub fn set_mem_notifier(&self, notifier: MemNotifier) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Whether an allocation error has occurred.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// Current heap statistics snapshot.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        Statistics {
            bytes_allocated: self.stats.bytes_allocated.load(Ordering::Relaxed),
            bytes_free: self.stats.bytes_free.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
            reuse: self.stats.reuse.load(Ordering::Relaxed),
            splits: self.stats.splits.load(Ordering::Relaxed),
            joins: self.stats.joins.load(Ordering::Relaxed),
            unpins: self.stats.unpins.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            try_fails: self.stats.try_fails.load(Ordering::Relaxed),
            collections: self.stats.collections.load(Ordering::Relaxed),
            aborted_collections: self.stats.aborted_collections.load(Ordering::Relaxed),
            swept: self.stats.swept.load(Ordering::Relaxed),
            freed: self.stats.freed.load(Ordering::Relaxed),
            warn_heap: self.warn_heap.load(Ordering::Relaxed),
            max_heap: self.max_heap.load(Ordering::Relaxed),
            cache_heap: self.cache_heap.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn alloc_exception(&self, cause: MemCause, size: usize) {
        self.has_error.store(true, Ordering::Release);
        let used = self.stats.bytes_allocated.load(Ordering::Relaxed);
        let policy = self.mem_policy();
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier(cause, policy, size, used);
        }
        match cause {
            MemCause::Fail | MemCause::TooBig => {
                eprintln!("pmr: unrecoverable memory allocation failure ({size} bytes)");
                std::process::exit(255);
            }
            MemCause::Limit => match policy {
                MemoryPolicy::Exit => {
                    eprintln!("pmr: memory limit exceeded ({size} bytes requested, {used} used)");
                    std::process::exit(2);
                }
                MemoryPolicy::Restart => restart_process(),
                MemoryPolicy::Continue => {
                    warn!("memory limit exceeded: {size} bytes requested, {used} in use");
                }
            },
            MemCause::Warning => {
                warn!("memory red-line crossed: {size} bytes requested, {used} in use");
            }
        }
    }

    pub(crate) fn check_block(&self, mp: *mut BlockHeader) {
        if !self.verify {
            return;
        }
        // Safety: callers pass headers derived from allocator-produced pointers.
        unsafe {
            let size = (*mp).size();
            assert!(size >= MIN_BLOCK && size < ALLOC_MAX, "corrupt block size {size}");
            assert_eq!(mp as usize & (ALIGN - 1), 0, "misaligned block");
        }
    }

    // ------------------------------------------------------------------
    // Yield protocol (mutator side)
    // ------------------------------------------------------------------

    /// Declares a GC safe point for the calling thread. See [`YieldFlags`] for
    /// the blocking modes.
    pub fn yield_control(&self, flags: YieldFlags) {
        let tp = self.threads.current();
        tp.yielded.store(true, Ordering::Release);
        if flags.contains(YieldFlags::STICKY) {
            tp.sticky.store(true, Ordering::Release);
        }
        tp.wait_for_sweeper
            .store(flags.contains(YieldFlags::COMPLETE), Ordering::Release);

        let mut block = flags.intersects(YieldFlags::BLOCK | YieldFlags::COMPLETE);
        while tp.yielded.load(Ordering::Acquire)
            && (self.must_yield.load(Ordering::Acquire) || block)
        {
            self.threads.cond.signal();
            if tp.sticky.load(Ordering::Acquire) || flags.contains(YieldFlags::NO_BLOCK) {
                return;
            }
            tp.cond.wait(None);
            if !tp.wait_for_sweeper.load(Ordering::Acquire) {
                block = false;
            }
        }
        if !tp.sticky.load(Ordering::Acquire) {
            tp.yielded.store(false, Ordering::Release);
        }
    }

    /// Ends a sticky yield. If marking restarted while the thread was sticky
    /// yielded, this blocks for the collection before returning.
    pub fn reset_yield(&self) {
        let tp = self.threads.current();
        tp.sticky.store(false, Ordering::Release);
        let must_block = {
            let _list = self.threads.list.lock();
            if self.must_yield.load(Ordering::Acquire)
                && (self.marking.load(Ordering::Acquire)
                    || (self.sweeping.load(Ordering::Acquire) && !self.config.parallel))
            {
                true
            } else {
                tp.yielded.store(false, Ordering::Release);
                false
            }
        };
        if must_block {
            self.yield_control(YieldFlags::empty());
        }
    }

    /// Runs `f` with the collector prevented from starting a stop-the-world
    /// pause. Used when enqueuing work from threads outside the runtime.
    pub fn with_gc_paused<T>(&self, f: impl FnOnce() -> T) -> T {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
        while self.must_yield.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        let result = f();
        self.pause_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Registers the calling thread with the collector. Threads are registered
    /// implicitly on their first yield; registering up front makes the thread
    /// visible to the collector before its first safe point.
    pub fn register_thread(&self) {
        let _ = self.threads.current();
    }

    /// Removes the calling thread from collector coordination. Must be called
    /// before a registered thread exits.
    pub fn deregister_thread(&self) {
        self.threads.deregister_current();
    }

    /// GC coordination record for the calling thread, registering it if
    /// needed. Lets embedders observe their own yield state.
    #[must_use]
    pub fn current_thread_record(&self) -> Arc<crate::threads::ThreadRecord> {
        self.threads.current()
    }

    /// Number of registered threads currently yielded.
    #[must_use]
    pub fn yielded_threads(&self) -> usize {
        self.threads
            .list
            .lock()
            .iter()
            .filter(|record| record.is_yielded())
            .count()
    }

    // ------------------------------------------------------------------
    // Collection control
    // ------------------------------------------------------------------

    /// Requests a collection. See [`GcFlags`].
    pub fn request_gc(&self, flags: GcFlags) {
        if !flags.contains(GcFlags::NO_BLOCK) {
            // Register before triggering: the cycle then cannot finish until
            // this thread reaches its yield below, so the completion wait
            // cannot miss the cycle it asked for.
            let _ = self.threads.current();
        }
        if flags.contains(GcFlags::FORCE)
            || self.work_done.load(Ordering::Relaxed) > self.config.work_quota
        {
            self.trigger_gc();
        }
        if !flags.contains(GcFlags::NO_BLOCK) {
            let yield_flags = if flags.contains(GcFlags::COMPLETE) {
                YieldFlags::COMPLETE
            } else {
                YieldFlags::empty()
            };
            self.yield_control(yield_flags);
        }
    }

    /// Enables or disables the collector. Returns the previous setting.
    pub fn enable_gc(&self, on: bool) -> bool {
        self.enabled.swap(on, Ordering::AcqRel)
    }

    pub(crate) fn trigger_gc(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        if !self.gc_requested.swap(true, Ordering::AcqRel) {
            self.gc_cond.signal();
        }
    }

    /// Wakes the collector thread regardless of the request state.
    pub fn wake_collector(&self) {
        self.gc_cond.signal();
    }

    /// Walks every region and queue asserting the structural invariants: the
    /// blocks of each region exactly partition it, every queued block maps back
    /// to its queue, and (optionally) no two adjacent blocks are both free.
    ///
    /// Must be called quiesced: no concurrent allocation or sweep.
    ///
    /// # Panics
    ///
    /// Panics if an invariant is violated.
    pub fn verify_integrity(&self, expect_coalesced: bool) {
        // Safety: the caller guarantees no concurrent mutation, so the region
        // chain and block sizes are stable for the duration of the walk.
        unsafe {
            let mut region = self.regions.load(Ordering::Acquire);
            while !region.is_null() {
                let end = Region::end(region);
                let mut mp = Region::start(region);
                let mut total = 0usize;
                let mut prev_free = false;
                let mut first = true;
                while mp < end {
                    let header = &*mp;
                    let size = header.size();
                    assert!(size >= MIN_BLOCK, "undersized block: {size}");
                    assert_eq!(mp as usize & (ALIGN - 1), 0, "misaligned block");
                    assert_eq!(header.is_first(), first, "first-block flag out of place");
                    first = false;
                    let free = header.is_free();
                    if expect_coalesced {
                        assert!(!(prev_free && free), "adjacent free blocks survived sweep");
                    }
                    prev_free = free;
                    total += size;
                    mp = next_block(mp);
                }
                assert_eq!(
                    total,
                    (*region).size - REGION_HEADER,
                    "blocks do not partition their region"
                );
                region = (*region).next.load(Ordering::Acquire);
            }
            for (qindex, queue) in self.queues.iter().enumerate() {
                let list = queue.list.lock();
                let mut mp = list.head;
                let mut count = 0usize;
                while !mp.is_null() {
                    assert!((*mp).is_free(), "unqueued block on free list");
                    assert_eq!(
                        crate::queue::size_to_queue((*mp).size()),
                        Some(qindex),
                        "block on wrong queue"
                    );
                    count += 1;
                    mp = (*crate::queue::free_entry(mp)).next;
                }
                assert_eq!(count, list.count, "queue count out of sync");
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.stop();
        // Safety: no other thread can reference the heap during drop; all
        // regions were mapped by virt_alloc.
        unsafe {
            let mut region = self.regions.load(Ordering::Acquire);
            while !region.is_null() {
                let next = (*region).next.load(Ordering::Acquire);
                let size = (*region).size;
                if libc::munmap(region.cast(), size) != 0 {
                    warn!("munmap of {size} bytes failed during heap teardown");
                }
                region = next;
            }
        }
    }
}

/// Default manager installed in managed blocks before the caller's manager.
fn manager_none(_ptr: *mut u8, _heap: &Heap, _event: ManageEvent) {}

fn policy_to_u8(policy: MemoryPolicy) -> u8 {
    match policy {
        MemoryPolicy::Exit => 0,
        MemoryPolicy::Restart => 1,
        MemoryPolicy::Continue => 2,
    }
}

fn policy_from_u8(value: u8) -> MemoryPolicy {
    match value {
        1 => MemoryPolicy::Restart,
        2 => MemoryPolicy::Continue,
        _ => MemoryPolicy::Exit,
    }
}

pub(crate) fn page_align(size: usize, page_size: usize) -> usize {
    (size + page_size - 1) & !(page_size - 1)
}

/// Largest piece of a spare that still fits on a queue, leaving any remainder
/// at least `MIN_BLOCK` long.
fn clip_spare(remaining: usize) -> usize {
    if remaining <= MAX_BLOCK {
        remaining
    } else if remaining - MAX_BLOCK >= MIN_BLOCK {
        MAX_BLOCK
    } else {
        MAX_BLOCK - MIN_BLOCK
    }
}

fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

fn system_memory_bytes() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        usize::MAX
    } else {
        usize::try_from(total).unwrap_or(usize::MAX)
    }
}

fn site_hash(location: &std::panic::Location<'_>) -> u64 {
    // FNV-1a over file:line
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in location.file().bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^= u64::from(location.line());
    hash.wrapping_mul(0x0000_0100_0000_01b3)
}

fn restart_process() -> ! {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let exe = std::env::current_exe().unwrap_or_else(|_| "/proc/self/exe".into());
        let args: Vec<String> = std::env::args().skip(1).collect();
        eprintln!("pmr: memory limit exceeded, restarting");
        let error = std::process::Command::new(exe).args(args).exec();
        eprintln!("pmr: restart failed: {error}");
    }
    std::process::exit(255);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::queue_to_size;

    #[test]
    fn page_align_rounds_up() {
        assert_eq!(page_align(1, 4096), 4096);
        assert_eq!(page_align(4096, 4096), 4096);
        assert_eq!(page_align(4097, 4096), 8192);
    }

    #[test]
    fn queue_min_sizes_match_mapping() {
        let heap = Heap::with_config(Configuration {
            enabled: false,
            ..Configuration::default()
        });
        for (qindex, queue) in heap.queues.iter().enumerate() {
            assert_eq!(queue.min_size, queue_to_size(qindex));
        }
    }

    #[test]
    fn policy_roundtrip() {
        for policy in [MemoryPolicy::Exit, MemoryPolicy::Restart, MemoryPolicy::Continue] {
            assert_eq!(policy_from_u8(policy_to_u8(policy)), policy);
        }
    }
}
