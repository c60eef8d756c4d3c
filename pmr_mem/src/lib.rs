//! # PMR Memory Service
//!
//! An application-specific memory allocator with a cooperative, non-compacting
//! mark-sweep garbage collector, built for embedded runtimes that need
//! deterministic allocation behavior.
//!
//! ## Overview
//!
//! The allocator cuts blocks from OS-mapped regions and recycles them through
//! segregated good-fit free queues. Allocation and free run in constant time;
//! fragmentation stays low because the sweeper accurately coalesces adjacent
//! free blocks. Unused memory is reclaimed by the collector rather than by
//! explicit frees.
//!
//! The collector is cooperative: every mutator thread periodically declares a
//! safe point with [`Heap::yield_control`], and the mark phase runs only once
//! every registered thread has yielded. Marking starts from the [root
//! set](Heap::add_root) and flows through per-type manager callbacks
//! registered with [`Heap::alloc_obj`]; a manager is invoked with
//! [`ManageEvent::Mark`] to mark the pointers its block owns, and with
//! [`ManageEvent::Free`] as a finalizer before the block is reclaimed. The
//! sweep phase runs in parallel with resumed mutator threads.
//!
//! Blocks can be pinned with [`Heap::hold`] / released with [`Heap::release`],
//! which makes them immune to collection without any root bookkeeping.
//!
//! ## Memory monitoring
//!
//! The heap enforces a configurable red-line and hard limit so depletion is
//! detected before the OS refuses memory. Breaches invoke a registered
//! notifier and the configured [`MemoryPolicy`].
//!
//! ## Environment
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `PMR_DISABLE_GC` | never run the collector |
//! | `PMR_SCRIBBLE_MEM` | fill freed blocks with a sentinel byte |
//! | `PMR_VERIFY_MEM` | extra integrity checks on every operation |
//! | `PMR_TRACK_MEM` | record an allocation-site hash per block |

mod block;
mod collector;
mod cond;
mod config;
mod error;
mod heap;
mod queue;
mod roots;
mod threads;

pub use block::{ALIGN, HEADER_SIZE, MAX_BLOCK, MIN_BLOCK, ManageEvent, ManagerFn};
pub use cond::Cond;
pub use config::{Configuration, MemCause, MemNotifier, MemoryPolicy, Statistics};
pub use error::{Error, Result};
pub use heap::{AllocFlags, GcFlags, HEAP, Heap, heap};
pub use threads::{ThreadRecord, YieldFlags};
