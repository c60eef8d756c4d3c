//! Block headers and backing regions.
//!
//! A block is a header followed by its payload. The header packs every field the
//! allocator and sweeper race over into a single atomic word so that concurrent
//! updates (mark vs. free vs. queue membership) are individually atomic.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

/// Allocation alignment. User pointers are always aligned to this.
pub const ALIGN: usize = 16;
pub(crate) const ALIGN_SHIFT: u32 = 4;

/// Header overhead per block.
pub const HEADER_SIZE: usize = 16;

/// Smallest block the allocator will carve. Leaves room for the free-list links.
pub const MIN_BLOCK: usize = 32;

/// A block is split only if the remainder would be at least this large.
pub(crate) const MIN_SPLIT: usize = MIN_BLOCK + HEADER_SIZE;

/// Blocks above this size bypass the free queues entirely and get a region of
/// their own. Sized so a default region always produces queueable spares.
pub const MAX_BLOCK: usize = 256 * 1024;

/// Size of the manager slot stored in the tail of managed blocks.
pub(crate) const MANAGER_SLOT: usize = size_of::<usize>();

const SIZE_BITS: u32 = 40;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;
const QINDEX_SHIFT: u32 = 40;
const QINDEX_MASK: u64 = 0xff << QINDEX_SHIFT;
const MARK_BIT: u64 = 1 << 48;
const ETERNAL_BIT: u64 = 1 << 49;
const FREE_BIT: u64 = 1 << 50;
const FIRST_BIT: u64 = 1 << 51;
const MANAGER_BIT: u64 = 1 << 52;
const FULL_REGION_BIT: u64 = 1 << 53;

/// Event passed to a manager callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManageEvent {
    /// Mark every owned pointer via [`Heap::mark_ptr`](crate::Heap::mark_ptr)
    Mark,
    /// The block is garbage; release any external resources. Runs at most once.
    Free,
}

/// Per-type manager callback registered at allocation time. Invoked with the
/// owning heap so the callback can mark the pointers its block owns.
pub type ManagerFn = fn(*mut u8, &crate::Heap, ManageEvent);

/// Block header. Two words: the packed field word and the allocation-site hash
/// recorded when `PMR_TRACK_MEM` is enabled.
#[repr(C, align(16))]
pub(crate) struct BlockHeader {
    word: AtomicU64,
    site: AtomicU64,
}

impl BlockHeader {
    /// Initializes a freshly carved block. Not atomic; the block is not yet published.
    pub(crate) fn init(&self, size: usize, first: bool) {
        debug_assert!(size >= MIN_BLOCK);
        debug_assert_eq!(size & (ALIGN - 1), 0);
        let mut word = size as u64 & SIZE_MASK;
        if first {
            word |= FIRST_BIT;
        }
        self.word.store(word, Ordering::Release);
        self.site.store(0, Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> u64 {
        self.word.load(Ordering::Acquire)
    }

    pub(crate) fn size(&self) -> usize {
        (self.load() & SIZE_MASK) as usize
    }

    /// Grows the block in place during a sweep join. Only the sweeper calls this.
    pub(crate) fn set_size(&self, size: usize) {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & !SIZE_MASK) | (size as u64 & SIZE_MASK))
            });
    }

    pub(crate) fn qindex(&self) -> usize {
        ((self.load() & QINDEX_MASK) >> QINDEX_SHIFT) as usize
    }

    pub(crate) fn is_free(&self) -> bool {
        self.load() & FREE_BIT != 0
    }

    pub(crate) fn is_first(&self) -> bool {
        self.load() & FIRST_BIT != 0
    }

    pub(crate) fn is_eternal(&self) -> bool {
        self.load() & ETERNAL_BIT != 0
    }

    pub(crate) fn has_manager(&self) -> bool {
        self.load() & MANAGER_BIT != 0
    }

    pub(crate) fn is_full_region(&self) -> bool {
        self.load() & FULL_REGION_BIT != 0
    }

    pub(crate) fn mark(&self) -> bool {
        self.load() & MARK_BIT != 0
    }

    pub(crate) fn set_mark(&self, mark: bool) {
        if mark {
            self.word.fetch_or(MARK_BIT, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!MARK_BIT, Ordering::AcqRel);
        }
    }

    /// Sets the mark to `mark` if it currently differs. Returns `true` if this call
    /// changed it, `false` if the block was already marked.
    pub(crate) fn try_mark(&self, mark: bool) -> bool {
        let desired = if mark { MARK_BIT } else { 0 };
        self.word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if word & MARK_BIT == desired {
                    None
                } else {
                    Some((word & !MARK_BIT) | desired)
                }
            })
            .is_ok()
    }

    pub(crate) fn set_eternal(&self, on: bool) {
        if on {
            self.word.fetch_or(ETERNAL_BIT, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!ETERNAL_BIT, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_has_manager(&self, on: bool) {
        if on {
            self.word.fetch_or(MANAGER_BIT, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!MANAGER_BIT, Ordering::AcqRel);
        }
    }

    pub(crate) fn set_full_region(&self, on: bool) {
        if on {
            self.word.fetch_or(FULL_REGION_BIT, Ordering::AcqRel);
        } else {
            self.word.fetch_and(!FULL_REGION_BIT, Ordering::AcqRel);
        }
    }

    /// Transitions free -> allocated with the given mark, clearing the queue index.
    /// Called with the owning free queue locked.
    pub(crate) fn set_allocated(&self, mark: bool) {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let mut word = word & !(FREE_BIT | QINDEX_MASK | MARK_BIT);
                if mark {
                    word |= MARK_BIT;
                }
                Some(word)
            });
    }

    /// Transitions allocated -> free on the given queue. Clears the manager flag;
    /// free blocks have no manager. Called with the target free queue locked.
    pub(crate) fn set_free(&self, qindex: usize) {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let word = (word & !(QINDEX_MASK | MANAGER_BIT))
                    | FREE_BIT
                    | ((qindex as u64) << QINDEX_SHIFT);
                Some(word)
            });
    }

    /// Clears the free bit and queue index after the sweeper claims the block.
    pub(crate) fn set_claimed(&self) {
        let _ = self
            .word
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(word & !(FREE_BIT | QINDEX_MASK))
            });
    }

    pub(crate) fn set_site(&self, site: u64) {
        self.site.store(site, Ordering::Relaxed);
    }

    pub(crate) fn site(&self) -> u64 {
        self.site.load(Ordering::Relaxed)
    }
}

/// Links threaded through the payload of a free block.
#[repr(C)]
pub(crate) struct FreeEntry {
    pub next: *mut BlockHeader,
    pub prev: *mut BlockHeader,
}

/// Region header preceding the first block of a backing OS mapping.
#[repr(C, align(16))]
pub(crate) struct Region {
    pub next: AtomicPtr<Region>,
    pub size: usize,
    pub freeable: AtomicBool,
    _pad: [u8; 7],
}

/// Region header overhead. The first block starts at this offset.
pub(crate) const REGION_HEADER: usize = 32;

const _: () = assert!(size_of::<Region>() == REGION_HEADER);
const _: () = assert!(size_of::<BlockHeader>() == HEADER_SIZE);

impl Region {
    /// First block in the region.
    ///
    /// # Safety
    /// `region` must point to a live region mapping.
    pub(crate) unsafe fn start(region: *mut Region) -> *mut BlockHeader {
        // Safety: the caller guarantees the mapping covers REGION_HEADER bytes.
        unsafe { region.cast::<u8>().add(REGION_HEADER).cast() }
    }

    /// One past the last byte of the region.
    ///
    /// # Safety
    /// `region` must point to a live region mapping.
    pub(crate) unsafe fn end(region: *mut Region) -> *mut BlockHeader {
        // Safety: region.size is the full mapping length set at creation.
        unsafe { region.cast::<u8>().add((*region).size).cast() }
    }
}

/// Next adjacent block. Races benignly with splitting: a stale size may skip a
/// freshly split spare, which the next sweep pass will visit.
///
/// # Safety
/// `mp` must point to a live block header within a region.
pub(crate) unsafe fn next_block(mp: *mut BlockHeader) -> *mut BlockHeader {
    // Safety: block sizes always stay within their region by construction.
    unsafe { mp.cast::<u8>().add((*mp).size()).cast() }
}

/// User pointer for a block.
///
/// # Safety
/// `mp` must point to a live block header.
pub(crate) unsafe fn payload(mp: *mut BlockHeader) -> *mut u8 {
    // Safety: the payload directly follows the fixed-size header.
    unsafe { mp.cast::<u8>().add(HEADER_SIZE) }
}

/// Block header for a user pointer.
///
/// # Safety
/// `ptr` must have been returned by this allocator.
pub(crate) unsafe fn header_of(ptr: *const u8) -> *mut BlockHeader {
    // Safety: alloc always returns payload pointers HEADER_SIZE past the header.
    unsafe { ptr.cast_mut().sub(HEADER_SIZE).cast() }
}

/// Usable payload length of a block.
///
/// # Safety
/// `mp` must point to a live block header.
pub(crate) unsafe fn usable_size(mp: *const BlockHeader) -> usize {
    // Safety: caller guarantees a live header.
    let header = unsafe { &*mp };
    let tail = if header.has_manager() { MANAGER_SLOT } else { 0 };
    header.size() - HEADER_SIZE - tail
}

/// Reads the manager slot from the block tail.
///
/// # Safety
/// `mp` must point to a live block with the manager flag set.
pub(crate) unsafe fn manager_of(mp: *mut BlockHeader) -> Option<ManagerFn> {
    // Safety: managed blocks reserve their last word for the manager pointer.
    unsafe {
        let slot = mp.cast::<u8>().add((*mp).size() - MANAGER_SLOT).cast::<usize>();
        let raw = slot.read();
        if raw == 0 {
            None
        } else {
            Some(std::mem::transmute::<usize, ManagerFn>(raw))
        }
    }
}

/// Writes the manager slot in the block tail.
///
/// # Safety
/// `mp` must point to a live block with the manager flag set.
pub(crate) unsafe fn set_manager(mp: *mut BlockHeader, manager: ManagerFn) {
    // Safety: managed blocks reserve their last word for the manager pointer.
    unsafe {
        let slot = mp.cast::<u8>().add((*mp).size() - MANAGER_SLOT).cast::<usize>();
        slot.write(manager as usize);
    }
}

/// Rounds a size up to the allocation alignment.
pub(crate) fn align_up(size: usize) -> usize {
    (size + ALIGN - 1) & !(ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(1), 16);
        assert_eq!(align_up(16), 16);
        assert_eq!(align_up(17), 32);
        assert_eq!(align_up(0), 0);
    }

    #[test]
    fn header_packing_roundtrip() {
        let header = BlockHeader {
            word: AtomicU64::new(0),
            site: AtomicU64::new(0),
        };
        header.init(4096, true);
        assert_eq!(header.size(), 4096);
        assert!(header.is_first());
        assert!(!header.is_free());
        assert!(!header.mark());

        header.set_free(17);
        assert!(header.is_free());
        assert_eq!(header.qindex(), 17);
        assert_eq!(header.size(), 4096);

        header.set_allocated(true);
        assert!(!header.is_free());
        assert_eq!(header.qindex(), 0);
        assert!(header.mark());

        header.set_eternal(true);
        assert!(header.is_eternal());
        header.set_eternal(false);
        assert!(!header.is_eternal());
    }

    #[test]
    fn try_mark_is_exclusive() {
        let header = BlockHeader {
            word: AtomicU64::new(0),
            site: AtomicU64::new(0),
        };
        header.init(64, false);
        assert!(header.try_mark(true));
        assert!(!header.try_mark(true));
        assert!(header.try_mark(false));
    }
}
