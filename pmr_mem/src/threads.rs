//! Mutator thread registry and the yield side of the GC protocol.
//!
//! Every thread that allocates or touches heap pointers carries a record here.
//! The collector iterates the list under its own lock while asking threads to
//! yield, so registration and removal must never hold any queue lock.

use crate::cond::Cond;
use bitflags::bitflags;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

bitflags! {
    /// Flags for [`Heap::yield_control`](crate::Heap::yield_control).
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct YieldFlags: u32 {
        /// Block until the next collection completes its mark phase
        const BLOCK = 0x1;
        /// Block until the sweep phase also completes
        const COMPLETE = 0x2;
        /// Remain yielded until [`Heap::reset_yield`](crate::Heap::reset_yield)
        const STICKY = 0x4;
        /// Never block, even if a collection is pending
        const NO_BLOCK = 0x8;
    }
}

/// Which categories of yielded threads to resume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Resume {
    /// Threads that did not ask to wait for the sweeper
    Yielded,
    /// Threads waiting for the sweep to complete
    Waiting,
    /// Everyone
    All,
}

/// Per-thread GC coordination record.
pub struct ThreadRecord {
    pub(crate) name: String,
    pub(crate) id: ThreadId,
    pub(crate) yielded: AtomicBool,
    pub(crate) sticky: AtomicBool,
    pub(crate) wait_for_sweeper: AtomicBool,
    pub(crate) cond: Cond,
}

impl ThreadRecord {
    fn new(name: String, id: ThreadId) -> Self {
        Self {
            name,
            id,
            yielded: AtomicBool::new(false),
            sticky: AtomicBool::new(false),
            wait_for_sweeper: AtomicBool::new(false),
            cond: Cond::new(),
        }
    }

    /// Whether this thread is currently yielded to the collector.
    pub fn is_yielded(&self) -> bool {
        self.yielded.load(Ordering::Acquire)
    }

    /// Diagnostic thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of mutator threads. The list has a dedicated lock because the
/// collector iterates it while threads come and go.
pub(crate) struct ThreadService {
    by_id: DashMap<ThreadId, Arc<ThreadRecord>>,
    pub(crate) list: parking_lot::Mutex<Vec<Arc<ThreadRecord>>>,
    /// Signalled by yielding threads; the collector waits here for acks
    pub(crate) cond: Cond,
}

impl ThreadService {
    pub(crate) fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            list: parking_lot::Mutex::new(Vec::new()),
            cond: Cond::new(),
        }
    }

    /// Record for the calling thread, registering it on first use.
    pub(crate) fn current(&self) -> Arc<ThreadRecord> {
        let id = thread::current().id();
        if let Some(record) = self.by_id.get(&id) {
            return Arc::clone(record.value());
        }
        let name = thread::current()
            .name()
            .unwrap_or("anonymous")
            .to_string();
        let record = Arc::new(ThreadRecord::new(name, id));
        self.by_id.insert(id, Arc::clone(&record));
        self.list.lock().push(Arc::clone(&record));
        record
    }

    /// Removes the calling thread from the registry. A thread that exits while
    /// registered and unyielded would stall every future collection.
    pub(crate) fn deregister_current(&self) {
        let id = thread::current().id();
        if self.by_id.remove(&id).is_some() {
            self.list.lock().retain(|record| record.id != id);
        }
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_registers_once() {
        let service = ThreadService::new();
        let first = service.current();
        let second = service.current();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.registered_count(), 1);
    }

    #[test]
    fn deregister_removes_record() {
        let service = ThreadService::new();
        let _record = service.current();
        service.deregister_current();
        assert_eq!(service.registered_count(), 0);
    }

    #[test]
    fn records_are_per_thread() {
        let service = Arc::new(ThreadService::new());
        let _main = service.current();
        let remote = Arc::clone(&service);
        std::thread::spawn(move || {
            let _worker = remote.current();
            assert_eq!(remote.registered_count(), 2);
        })
        .join()
        .expect("worker thread");
    }
}
