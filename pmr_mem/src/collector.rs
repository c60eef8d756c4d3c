//! The collector: marker thread, thread pausing, mark and sweep phases.
//!
//! The mark phase runs with every registered thread yielded. In parallel mode
//! the sweep then runs alongside resumed mutators: the only state it shares
//! with the allocator is the packed header word, the free queues (claimed with
//! try-locks) and the region list head (CAS).

use crate::block::{BlockHeader, HEADER_SIZE, ManageEvent, Region, manager_of, next_block, payload};
use crate::heap::{Heap, SCRIBBLE_BYTE};
use crate::threads::Resume;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

impl Heap {
    /// Main loop for the collector thread.
    pub(crate) fn collector_main(&self) {
        debug!("collector thread started");
        // The collector itself counts as permanently yielded
        let tp = self.threads.current();
        tp.sticky.store(true, Ordering::Release);
        tp.yielded.store(true, Ordering::Release);

        while !self.shutdown.load(Ordering::Acquire) {
            if !self.must_yield.load(Ordering::Acquire) {
                self.gc_cond.wait(None);
                if self.shutdown.load(Ordering::Acquire) {
                    break;
                }
            }
            if self.gc_requested.load(Ordering::Acquire) {
                self.mark_and_sweep();
            }
        }
        self.threads.deregister_current();
        debug!("collector thread shutting down");
    }

    /// One full collection cycle. Aborts without freeing anything when the
    /// threads cannot all be brought to a safe point in time.
    pub(crate) fn mark_and_sweep(&self) {
        trace!("GC: mark started");
        self.must_yield.store(true, Ordering::Release);

        if !self.pause_threads() {
            trace!("GC synchronization timed out, some threads did not yield; retrying later");
            self.stats.aborted_collections.fetch_add(1, Ordering::Relaxed);
            self.gc_requested.store(false, Ordering::Release);
            self.resume_threads(Resume::All);
            return;
        }
        self.stats.collections.fetch_add(1, Ordering::Relaxed);
        self.gc_requested.store(false, Ordering::Release);
        self.work_done.store(0, Ordering::Relaxed);

        // Toggle the generation and mark everything reachable from the roots
        let active = !self.active_mark.load(Ordering::Acquire);
        self.active_mark.store(active, Ordering::Release);
        self.mark_roots();

        self.sweeping.store(true, Ordering::Release);
        self.marking.store(false, Ordering::Release);

        if self.config.parallel {
            self.resume_threads(Resume::Yielded);
        }
        self.sweep();
        self.sweeping.store(false, Ordering::Release);

        if self.config.parallel {
            self.resume_threads(Resume::Waiting);
        } else {
            self.resume_threads(Resume::All);
        }
    }

    /// Waits for every registered thread to yield. Returns `false` on timeout
    /// or while outside threads hold the GC pause counter. Sets `marking` on
    /// success, with the thread list lock held.
    fn pause_threads(&self) -> bool {
        let timeout = self.config.gc_sync_timeout;
        let start = Instant::now();
        trace!("pause threads, timeout {timeout:?}");
        loop {
            {
                let list = self.threads.list.lock();
                if self.pause_count.load(Ordering::SeqCst) == 0 {
                    let unyielded = list.iter().find(|record| !record.is_yielded());
                    match unyielded {
                        None => {
                            self.marking.store(true, Ordering::Release);
                            return true;
                        }
                        Some(record) => {
                            if start.elapsed() > Duration::from_secs(1) {
                                trace!("thread {} is not yielding", record.name());
                            }
                        }
                    }
                }
            }
            if start.elapsed() >= timeout {
                return false;
            }
            self.threads.cond.wait(Some(Duration::from_millis(20)));
        }
    }

    /// Resumes yielded threads. `Yielded` skips threads waiting for the sweep,
    /// `Waiting` resumes only those, `All` resumes everyone.
    pub(crate) fn resume_threads(&self, which: Resume) {
        let list = self.threads.list.lock();
        self.must_yield.store(false, Ordering::Release);
        for record in list.iter() {
            if !record.is_yielded() {
                continue;
            }
            let waiting = record.wait_for_sweeper.load(Ordering::Acquire);
            match which {
                Resume::Yielded if waiting => continue,
                Resume::Waiting if !waiting => continue,
                _ => {}
            }
            if !record.sticky.load(Ordering::Acquire) {
                record.yielded.store(false, Ordering::Release);
            }
            record.wait_for_sweeper.store(false, Ordering::Release);
            record.cond.signal();
        }
    }

    /// Marks every root and, through manager callbacks, the reachable closure.
    fn mark_roots(&self) {
        trace!("GC: marking {} roots", self.roots.len());
        self.roots.for_each(|root| self.mark_ptr(root));
    }

    /// Runs manager `Free` callbacks over garbage blocks so that dependent
    /// blocks still exist while finalizers observe them.
    fn invoke_destructors(&self) {
        let active = self.active_mark.load(Ordering::Acquire);
        let mut region = self.regions.load(Ordering::Acquire);
        // Safety: regions are only unlinked by this thread; block walking races
        // only with splits, which at worst hide a freshly carved free block.
        unsafe {
            while !region.is_null() {
                let end = Region::end(region);
                let mut mp = Region::start(region);
                while mp < end {
                    let header = &*mp;
                    if header.mark() != active
                        && !header.is_free()
                        && !header.is_eternal()
                        && header.has_manager()
                    {
                        if let Some(manager) = manager_of(mp) {
                            manager(payload(mp), self, ManageEvent::Free);
                            // The manager may have revived the block
                            if header.mark() != active {
                                header.set_has_manager(false);
                            }
                        }
                    }
                    mp = next_block(mp);
                }
                region = (*region).next.load(Ordering::Acquire);
            }
        }
    }

    /// Claims a free block away from its queue for coalescing. Returns `false`
    /// if the allocator got there first or the queue is contended.
    ///
    /// # Safety
    /// `mp` must point to a live block header.
    unsafe fn claim(&self, mp: *mut BlockHeader) -> bool {
        // Safety: header reads are atomic; the list operation happens under the
        // queue lock with membership re-verified.
        unsafe {
            let qindex = (*mp).qindex();
            if qindex == 0 {
                return false;
            }
            let freeq = &self.queues[qindex];
            let Some(mut list) = freeq.list.try_lock() else {
                self.stats.try_fails.fetch_add(1, Ordering::Relaxed);
                return false;
            };
            if (*mp).qindex() != qindex || !(*mp).is_free() {
                return false;
            }
            crate::queue::unlink(&mut list, mp);
            (*mp).set_claimed();
            drop(list);
            self.stats.bytes_free.fetch_sub((*mp).size(), Ordering::Relaxed);
            true
        }
    }

    /// Sweeps the heap: runs destructors, frees garbage, coalesces neighbors
    /// and returns empty regions to the OS.
    pub(crate) fn sweep(&self) {
        if !self.enabled.load(Ordering::Acquire) {
            trace!("sweep aborted, GC disabled");
            return;
        }
        trace!("GC: sweep started");
        self.invoke_destructors();

        let active = self.active_mark.load(Ordering::Acquire);
        let cache_heap = self.cache_heap.load(Ordering::Relaxed);

        // Racing with grow_heap, which prepends regions. This loop is the only
        // code that unlinks them.
        let mut prior: *mut Region = std::ptr::null_mut();
        let mut region = self.regions.load(Ordering::Acquire);
        // Safety: region/block traversal as in invoke_destructors; free-queue
        // moves go through claim/link_block which take the queue locks.
        unsafe {
            while !region.is_null() {
                let next_region = (*region).next.load(Ordering::Acquire);
                let join =
                    self.stats.bytes_free.load(Ordering::Relaxed) >= cache_heap;

                let end = Region::end(region);
                let mut mp = Region::start(region);
                while mp < end {
                    let mut next = next_block(mp);
                    let header = &*mp;

                    if header.is_eternal() {
                        mp = next;
                        continue;
                    }
                    if header.is_free() && join {
                        // Claim a free block ahead of garbage so the pair joins
                        if next < end
                            && !(*next).is_free()
                            && (*next).mark() != active
                            && self.claim(mp)
                        {
                            header.set_mark(!active);
                        }
                    }
                    if !header.is_free() && header.mark() != active {
                        if join {
                            while next < end && !(*next).is_eternal() {
                                if (*next).is_free() {
                                    if !self.claim(next) {
                                        break;
                                    }
                                    header.set_size(header.size() + (*next).size());
                                    self.stats.joins.fetch_add(1, Ordering::Relaxed);
                                } else if (*next).mark() != active {
                                    header.set_size(header.size() + (*next).size());
                                    self.stats.joins.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    break;
                                }
                                next = next_block(mp);
                            }
                        }
                        self.free_block(mp, region);
                    }
                    mp = next;
                }

                if (*region).freeable.load(Ordering::Acquire) {
                    self.unlink_region(prior, region, next_region);
                } else {
                    prior = region;
                }
                region = next_region;
            }
        }
        trace!("GC: sweep completed");
    }

    /// Frees one garbage block: either marks its region freeable (when the
    /// block now spans the whole region) or links it onto a free queue.
    ///
    /// # Safety
    /// `mp` must be an unqueued garbage block inside `region`.
    unsafe fn free_block(&self, mp: *mut BlockHeader, region: *mut Region) {
        // Safety: the sweeper owns garbage blocks outright.
        unsafe {
            self.check_block(mp);
            self.stats.swept.fetch_add(1, Ordering::Relaxed);
            self.stats.freed.fetch_add((*mp).size(), Ordering::Relaxed);
            if self.scribble {
                payload(mp).write_bytes(SCRIBBLE_BYTE, (*mp).size() - HEADER_SIZE);
            }
            if (*mp).is_first() && next_block(mp) >= Region::end(region) {
                let cache_heap = self.cache_heap.load(Ordering::Relaxed);
                if (*mp).is_full_region()
                    || self.stats.bytes_free.load(Ordering::Relaxed) >= cache_heap
                {
                    (*region).freeable.store(true, Ordering::Release);
                    return;
                }
            }
            if crate::queue::size_to_queue((*mp).size()).is_none() {
                // Joins outgrew the queues without spanning the region. Keep the
                // block as garbage; once its remaining neighbors die the whole
                // region is unpinned in one piece.
                (*mp).set_mark(self.active_mark.load(Ordering::Acquire));
                return;
            }
            if !self.link_block(mp) {
                // Contended queue: make the block live for this cycle so the
                // next toggle turns it back into garbage and the sweep retries
                (*mp).set_mark(self.active_mark.load(Ordering::Acquire));
            }
        }
    }

    /// Unlinks a freeable region and returns its pages. CAS-guarded against a
    /// concurrent `grow_heap` prepending to the head.
    ///
    /// # Safety
    /// `region` must be freeable with `prior` its last observed predecessor.
    unsafe fn unlink_region(
        &self,
        prior: *mut Region,
        region: *mut Region,
        next_region: *mut Region,
    ) {
        // Safety: only the sweeper unlinks; growers only prepend at the head.
        unsafe {
            if prior.is_null() {
                if self
                    .regions
                    .compare_exchange(region, next_region, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // A grower prepended; re-walk to find our predecessor
                    let mut walk = self.regions.load(Ordering::Acquire);
                    let mut found_prior: *mut Region = std::ptr::null_mut();
                    while !walk.is_null() && walk != region {
                        found_prior = walk;
                        walk = (*walk).next.load(Ordering::Acquire);
                    }
                    if walk != region || found_prior.is_null() {
                        return;
                    }
                    (*found_prior).next.store(next_region, Ordering::Release);
                }
            } else {
                (*prior).next.store(next_region, Ordering::Release);
            }
            let size = (*region).size;
            self.stats.bytes_allocated.fetch_sub(size, Ordering::Relaxed);
            self.stats.unpins.fetch_add(1, Ordering::Relaxed);
            trace!("unpin region of {size} bytes");
            self.virt_free(region.cast(), size);
        }
    }
}
