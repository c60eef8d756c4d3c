//! The event service: five dispatcher queues, the main loop, and scheduling.

use crate::dispatcher::{Dispatcher, RunQ};
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags};
use crate::notify::{CondNotifier, Notifier};
use crate::worker::WorkerService;
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use pmr_mem::Heap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Worker-prune timer period.
const PRUNE_PERIOD_MS: i64 = 60_000;

bitflags! {
    /// Flags for [`EventService::service_events`].
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct ServiceFlags: u32 {
        /// Return after servicing one dispatcher pass
        const ONE_THING = 0x1;
    }
}

/// Global event service bound to the global heap
pub static EVENT_SERVICE: LazyLock<Arc<EventService>> = LazyLock::new(|| {
    let service = EventService::new(Arc::clone(pmr_mem::heap()));
    service.start();
    service
});

/// Returns the process-wide event service.
#[must_use]
pub fn event_service() -> &'static Arc<EventService> {
    &EVENT_SERVICE
}

pub(crate) struct ServiceInner {
    run: Vec<Arc<Dispatcher>>,
    ready: VecDeque<Arc<Dispatcher>>,
    idle: Vec<Arc<Dispatcher>>,
    pending: VecDeque<Arc<Dispatcher>>,
    wait: Vec<Arc<Dispatcher>>,
    pub will_awake: i64,
    pub waiting: bool,
    pub pending_count: usize,
}

/// Owner of every dispatcher queue and the `service_events` main loop.
pub struct EventService {
    this: Weak<Self>,
    heap: Arc<Heap>,
    inner: Mutex<ServiceInner>,
    epoch: Instant,
    now: AtomicI64,
    event_count: AtomicU64,
    eventing: AtomicBool,
    notifier: Mutex<Arc<dyn Notifier>>,
    workers: WorkerService,
    nonblock: OnceLock<Arc<Dispatcher>>,
    default_dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl EventService {
    /// Creates an event service over the given heap.
    #[must_use]
    pub fn new(heap: Arc<Heap>) -> Arc<Self> {
        let service = Arc::new_cyclic(|this: &Weak<Self>| Self {
            this: this.clone(),
            workers: WorkerService::new(Arc::clone(&heap), this.clone()),
            heap,
            inner: Mutex::new(ServiceInner {
                run: Vec::new(),
                ready: VecDeque::new(),
                idle: Vec::new(),
                pending: VecDeque::new(),
                wait: Vec::new(),
                will_awake: i64::MAX,
                waiting: false,
                pending_count: 0,
            }),
            epoch: Instant::now(),
            now: AtomicI64::new(0),
            event_count: AtomicU64::new(0),
            eventing: AtomicBool::new(false),
            notifier: Mutex::new(Arc::new(CondNotifier::new())),
            nonblock: OnceLock::new(),
            default_dispatcher: OnceLock::new(),
        });
        let _ = service
            .nonblock
            .set(Dispatcher::new(Arc::clone(&service), "nonblock", true));
        let _ = service
            .default_dispatcher
            .set(Dispatcher::new(Arc::clone(&service), "default", true));
        service
    }

    /// Starts periodic service housekeeping (the worker pruner timer).
    pub fn start(&self) {
        let weak = self.this.clone();
        self.default_dispatcher().create_event(
            "pruneWorkers",
            PRUNE_PERIOD_MS,
            EventFlags::CONTINUOUS,
            move |_event| {
                if let Some(service) = weak.upgrade() {
                    service.workers().prune();
                }
            },
        );
    }

    /// Stops the worker pool. Dispatchers already queued stay queued; a final
    /// `service_events` pass may drain them.
    pub fn stop(&self) {
        self.workers.stop();
    }

    /// The heap this service coordinates with.
    #[must_use]
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The worker pool.
    #[must_use]
    pub fn workers(&self) -> &WorkerService {
        &self.workers
    }

    /// The dispatcher whose events run inline on the event loop thread.
    #[must_use]
    pub fn nonblock_dispatcher(&self) -> &Arc<Dispatcher> {
        self.nonblock.get().expect("service initialized")
    }

    /// The default dispatcher for service housekeeping and ad hoc timers.
    #[must_use]
    pub fn default_dispatcher(&self) -> &Arc<Dispatcher> {
        self.default_dispatcher.get().expect("service initialized")
    }

    /// Creates a named dispatcher, initially idle and enabled.
    ///
    /// # Errors
    ///
    /// If the service no longer has a strong reference to hand the dispatcher.
    pub fn create_dispatcher(&self, name: &str) -> Result<Arc<Dispatcher>> {
        let Some(service) = self.this.upgrade() else {
            return Err(Error::CantCreate(format!(
                "dispatcher {name}: failed to upgrade weak reference to event service"
            )));
        };
        let dispatcher = Dispatcher::new(service, name, true);
        self.schedule_dispatcher(&dispatcher);
        Ok(dispatcher)
    }

    /// Creates an event on `dispatcher` from a thread outside the runtime,
    /// cooperating with the collector through the pause counter so the
    /// enqueue cannot race a stop-the-world pause.
    pub fn create_event_outside(
        &self,
        dispatcher: &Arc<Dispatcher>,
        name: &str,
        delay_ms: i64,
        flags: EventFlags,
        proc_: impl Fn(&Arc<Event>) + Send + Sync + 'static,
    ) -> Arc<Event> {
        self.heap
            .with_gc_paused(|| dispatcher.create_event(name, delay_ms, flags, proc_))
    }

    // ------------------------------------------------------------------
    // Ticks
    // ------------------------------------------------------------------

    /// Cached service time in milliseconds.
    #[must_use]
    pub fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    /// Refreshes and returns the service time.
    pub fn refresh_now(&self) -> i64 {
        let now = i64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.now.store(now, Ordering::Release);
        now
    }

    pub(crate) fn add_event_count(&self, count: usize) {
        self.event_count.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Total events serviced since creation.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Notifier
    // ------------------------------------------------------------------

    /// Installs the I/O notifier used by the main loop's idle wait.
    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.notifier.lock() = notifier;
    }

    /// Wakes the main loop out of its idle wait.
    pub fn wake(&self) {
        self.notifier.lock().wake();
    }

    /// Wakes the main loop if dispatchers are parked on the pending queue.
    /// Called when workers become available.
    pub(crate) fn wake_if_pending(&self) {
        let must_wake = !self.inner.lock().pending.is_empty();
        if must_wake {
            self.wake();
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, ServiceInner> {
        self.inner.lock()
    }

    // ------------------------------------------------------------------
    // Queue transitions
    // ------------------------------------------------------------------

    fn dequeue_locked(inner: &mut ServiceInner, dispatcher: &Arc<Dispatcher>, queue: RunQ) {
        let remove = |list: &mut Vec<Arc<Dispatcher>>| {
            list.retain(|entry| !Arc::ptr_eq(entry, dispatcher));
        };
        let remove_deque = |list: &mut VecDeque<Arc<Dispatcher>>| {
            list.retain(|entry| !Arc::ptr_eq(entry, dispatcher));
        };
        match queue {
            RunQ::None => {}
            RunQ::Idle => remove(&mut inner.idle),
            RunQ::Wait => remove(&mut inner.wait),
            RunQ::Ready => remove_deque(&mut inner.ready),
            RunQ::Run => remove(&mut inner.run),
            RunQ::Pending => {
                let before = inner.pending.len();
                remove_deque(&mut inner.pending);
                inner.pending_count -= before - inner.pending.len();
            }
        }
    }

    fn enqueue_locked(inner: &mut ServiceInner, dispatcher: &Arc<Dispatcher>, queue: RunQ) {
        match queue {
            RunQ::None => {}
            RunQ::Idle => inner.idle.push(Arc::clone(dispatcher)),
            RunQ::Wait => inner.wait.push(Arc::clone(dispatcher)),
            RunQ::Ready => inner.ready.push_back(Arc::clone(dispatcher)),
            RunQ::Run => inner.run.push(Arc::clone(dispatcher)),
            RunQ::Pending => {
                inner.pending.push_back(Arc::clone(dispatcher));
                inner.pending_count += 1;
            }
        }
    }

    /// Moves a dispatcher to the queue its state calls for. Running or
    /// disabled dispatchers are left in place, waking their waiters instead.
    pub(crate) fn schedule_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        let mut wake_service = false;
        let mut wake_cond = false;
        {
            let mut inner = self.inner.lock();
            let mut state = dispatcher.state.lock();
            if state.destroyed {
                return;
            }
            if state.queue == RunQ::Run || !state.enabled {
                wake_service = inner.waiting;
                wake_cond = state.waiting;
            } else if let Some(due) = dispatcher.earliest_due() {
                Self::dequeue_locked(&mut inner, dispatcher, state.queue);
                if due > self.now() {
                    Self::enqueue_locked(&mut inner, dispatcher, RunQ::Wait);
                    state.queue = RunQ::Wait;
                    if due < inner.will_awake {
                        wake_service = true;
                        wake_cond = state.waiting;
                    }
                } else {
                    Self::enqueue_locked(&mut inner, dispatcher, RunQ::Ready);
                    state.queue = RunQ::Ready;
                    wake_service = inner.waiting;
                    wake_cond = state.waiting;
                }
            } else {
                Self::dequeue_locked(&mut inner, dispatcher, state.queue);
                Self::enqueue_locked(&mut inner, dispatcher, RunQ::Idle);
                state.queue = RunQ::Idle;
            }
        }
        if wake_cond {
            dispatcher.signal();
        }
        if wake_service {
            self.wake();
        }
    }

    /// Dequeues a dispatcher after a run completes, then re-evaluates its
    /// queue. Without the dequeue the dispatcher would still look running and
    /// never leave the run queue.
    pub(crate) fn reschedule_after_run(&self, dispatcher: &Arc<Dispatcher>) {
        {
            let mut inner = self.inner.lock();
            let mut state = dispatcher.state.lock();
            Self::dequeue_locked(&mut inner, dispatcher, state.queue);
            state.queue = RunQ::None;
        }
        self.schedule_dispatcher(dispatcher);
    }

    /// Forces a dispatcher onto the run queue (claimed by the caller).
    pub(crate) fn make_runnable(&self, dispatcher: &Arc<Dispatcher>) {
        let mut inner = self.inner.lock();
        let mut state = dispatcher.state.lock();
        if state.destroyed || state.queue == RunQ::Run {
            return;
        }
        Self::dequeue_locked(&mut inner, dispatcher, state.queue);
        Self::enqueue_locked(&mut inner, dispatcher, RunQ::Run);
        state.queue = RunQ::Run;
    }

    pub(crate) fn enable_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        {
            let _inner = self.inner.lock();
            let mut state = dispatcher.state.lock();
            if state.destroyed {
                return;
            }
            state.enabled = true;
        }
        self.schedule_dispatcher(dispatcher);
    }

    pub(crate) fn disable_dispatcher(&self, dispatcher: &Arc<Dispatcher>, destroy: bool) {
        dispatcher.events.lock().clear();
        {
            let mut inner = self.inner.lock();
            let mut state = dispatcher.state.lock();
            Self::dequeue_locked(&mut inner, dispatcher, state.queue);
            state.queue = RunQ::None;
            state.enabled = false;
            if destroy {
                state.destroyed = true;
            }
        }
        // Unblock any waiter so it can observe the state change
        dispatcher.signal();
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Services dispatcher events until `timeout` expires (`None` runs until
    /// the queues stay empty forever; callers normally bound it). Returns the
    /// number of events serviced.
    pub fn service_events(&self, timeout: Option<Duration>, flags: ServiceFlags) -> usize {
        if self.eventing.swap(true, Ordering::SeqCst) {
            error!("service_events called reentrantly");
            return 0;
        }
        let begin = self.event_count();
        let mut now = self.refresh_now();
        let expires = match timeout {
            Some(timeout) => now.saturating_add(i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX)),
            None => i64::MAX,
        };
        let just_one = flags.contains(ServiceFlags::ONE_THING);

        while now < expires {
            let pass_count = self.event_count();
            while let Some(dispatcher) = self.get_next_ready() {
                if !self.run_dispatcher(&dispatcher) {
                    // No worker available: park on pending until one frees up
                    let mut inner = self.inner.lock();
                    let mut state = dispatcher.state.lock();
                    Self::dequeue_locked(&mut inner, &dispatcher, state.queue);
                    Self::enqueue_locked(&mut inner, &dispatcher, RunQ::Pending);
                    state.queue = RunQ::Pending;
                    continue;
                }
                if just_one {
                    self.eventing.store(false, Ordering::SeqCst);
                    return usize::try_from(self.event_count() - begin).unwrap_or(usize::MAX);
                }
            }
            if self.event_count() == pass_count {
                // Nothing serviced this pass: sleep until the next due time
                let delay = {
                    let mut inner = self.inner.lock();
                    let delay = self.idle_delay_locked(&inner, expires.saturating_sub(now));
                    if delay > 0 {
                        inner.will_awake = now.saturating_add(delay);
                        inner.waiting = true;
                    }
                    delay
                };
                if delay > 0 {
                    let notifier = Arc::clone(&*self.notifier.lock());
                    notifier.wait_for_io(Duration::from_millis(u64::try_from(delay).unwrap_or(0)));
                    let mut inner = self.inner.lock();
                    inner.waiting = false;
                    inner.will_awake = i64::MAX;
                }
            }
            now = self.refresh_now();
            if just_one {
                break;
            }
        }
        self.eventing.store(false, Ordering::SeqCst);
        usize::try_from(self.event_count() - begin).unwrap_or(usize::MAX)
    }

    /// Milliseconds until the earliest queued due time, clipped to `cap`.
    fn idle_delay_locked(&self, inner: &ServiceInner, cap: i64) -> i64 {
        if !inner.ready.is_empty() {
            return 0;
        }
        let now = self.now();
        let mut delay = cap.max(0);
        for dispatcher in &inner.wait {
            if let Some(due) = dispatcher.earliest_due() {
                delay = delay.min((due - now).max(0));
            }
        }
        delay
    }

    /// Pops the next dispatcher to run: pending first (when workers are
    /// available), then ready, promoting due waiters when ready is empty.
    fn get_next_ready(&self) -> Option<Arc<Dispatcher>> {
        let mut inner = self.inner.lock();

        if !inner.pending.is_empty() && self.workers.available_workers() > 0 {
            if let Some(dispatcher) = inner.pending.pop_front() {
                inner.pending_count -= 1;
                let mut state = dispatcher.state.lock();
                Self::enqueue_locked(&mut inner, &dispatcher, RunQ::Run);
                state.queue = RunQ::Run;
                state.owner = None;
                drop(state);
                return Some(dispatcher);
            }
        }
        if inner.ready.is_empty() {
            let now = self.now();
            let promote = inner.wait.iter().position(|dispatcher| {
                let state = dispatcher.state.lock();
                state.enabled
                    && dispatcher
                        .earliest_due()
                        .is_some_and(|due| due <= now)
            });
            if let Some(index) = promote {
                let dispatcher = inner.wait.remove(index);
                let mut state = dispatcher.state.lock();
                Self::enqueue_locked(&mut inner, &dispatcher, RunQ::Ready);
                state.queue = RunQ::Ready;
            }
        }
        if let Some(dispatcher) = inner.ready.pop_front() {
            let mut state = dispatcher.state.lock();
            Self::enqueue_locked(&mut inner, &dispatcher, RunQ::Run);
            state.queue = RunQ::Run;
            state.owner = None;
            drop(state);
            return Some(dispatcher);
        }
        None
    }

    /// Runs a dispatcher taken off the run queue: inline for the non-blocking
    /// dispatcher, on its dedicated worker if bound, otherwise on any idle
    /// worker. Returns `false` when no worker is available.
    fn run_dispatcher(&self, dispatcher: &Arc<Dispatcher>) -> bool {
        dispatcher.state.lock().owner = Some(std::thread::current().id());

        if Arc::ptr_eq(dispatcher, self.nonblock_dispatcher()) {
            self.service_dispatcher_main(dispatcher);
            return true;
        }
        let Some(service) = self.this.upgrade() else {
            return false;
        };
        let required = dispatcher.required_worker.lock().clone();
        if let Some(worker) = required {
            let target = Arc::clone(dispatcher);
            return self.workers.activate(
                &worker,
                Box::new(move |_worker| service.service_dispatcher_main(&target)),
            );
        }
        let target = Arc::clone(dispatcher);
        self.workers
            .start_worker(Box::new(move |_worker| {
                service.service_dispatcher_main(&target);
            }))
            .is_ok()
    }

    /// Worker-side dispatcher run.
    pub(crate) fn service_dispatcher_main(&self, dispatcher: &Arc<Dispatcher>) {
        {
            let state = dispatcher.state.lock();
            // The dispatcher may have been disabled after the worker started
            if !state.enabled || state.destroyed {
                return;
            }
        }
        dispatcher.state.lock().owner = Some(std::thread::current().id());
        dispatcher.dispatch_events();
        if dispatcher.is_enabled() {
            dispatcher.state.lock().owner = None;
            self.reschedule_after_run(dispatcher);
        }
    }

    /// Whether every dispatcher is idle (no queued or running work).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.run.is_empty() && inner.ready.is_empty() && inner.pending.is_empty()
    }

    /// Number of dispatchers parked awaiting a worker.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending_count
    }

    #[cfg(test)]
    pub(crate) fn queue_of(&self, dispatcher: &Arc<Dispatcher>) -> RunQ {
        dispatcher.state.lock().queue
    }
}

impl Drop for EventService {
    fn drop(&mut self) {
        trace!("event service dropped");
        self.workers.stop();
    }
}
