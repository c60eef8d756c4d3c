//! Events: a callback plus a due time, owned by a dispatcher.

use crate::dispatcher::Dispatcher;
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

bitflags! {
    /// Event behavior flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EventFlags: u32 {
        /// Reschedule the event after each run using its period
        const CONTINUOUS = 0x1;
        /// The callback is currently executing
        const RUNNING = 0x2;
    }
}

/// Event callback. Receives the event so continuous callbacks can inspect or
/// cancel themselves.
pub type EventProc = Arc<dyn Fn(&Arc<Event>) + Send + Sync>;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// A scheduled callback. Events on one dispatcher run in due-time order, FIFO
/// for ties, and never concurrently with each other.
pub struct Event {
    name: String,
    seq: u64,
    due: AtomicI64,
    period: i64,
    flags: AtomicU32,
    pub(crate) proc_: EventProc,
    pub(crate) dispatcher: Mutex<Weak<Dispatcher>>,
}

impl Event {
    pub(crate) fn new(
        name: &str,
        due: i64,
        period: i64,
        flags: EventFlags,
        proc_: EventProc,
        dispatcher: Weak<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            due: AtomicI64::new(due),
            period,
            flags: AtomicU32::new(flags.bits()),
            proc_,
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// Diagnostic event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Milliseconds (service ticks) at which the event becomes due.
    #[must_use]
    pub fn due(&self) -> i64 {
        self.due.load(Ordering::Acquire)
    }

    pub(crate) fn set_due(&self, due: i64) {
        self.due.store(due, Ordering::Release);
    }

    /// Reschedule period in milliseconds for continuous events.
    #[must_use]
    pub fn period(&self) -> i64 {
        self.period
    }

    #[must_use]
    pub fn flags(&self) -> EventFlags {
        EventFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.flags().contains(EventFlags::CONTINUOUS)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.flags().contains(EventFlags::RUNNING)
    }

    pub(crate) fn set_running(&self, on: bool) {
        if on {
            self.flags.fetch_or(EventFlags::RUNNING.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!EventFlags::RUNNING.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn clear_continuous(&self) {
        self.flags.fetch_and(!EventFlags::CONTINUOUS.bits(), Ordering::AcqRel);
    }

    /// Ordering key: due time first, FIFO sequence for ties.
    pub(crate) fn key(&self) -> (i64, u64) {
        (self.due(), self.seq)
    }

    /// The dispatcher this event is scheduled on, if it still exists.
    #[must_use]
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.lock().upgrade()
    }
}
