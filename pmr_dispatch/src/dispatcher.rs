//! Dispatchers: serial execution contexts holding time-ordered event queues.

use crate::error::{Error, Result};
use crate::event::{Event, EventFlags, EventProc};
use crate::service::EventService;
use crate::worker::Worker;
use parking_lot::Mutex;
use pmr_mem::YieldFlags;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;
use tracing::{error, trace};

/// Which service queue a dispatcher currently sits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RunQ {
    None,
    Idle,
    Wait,
    Ready,
    Run,
    Pending,
}

pub(crate) struct DispatcherState {
    pub queue: RunQ,
    pub enabled: bool,
    pub destroyed: bool,
    pub waiting: bool,
    pub owner: Option<ThreadId>,
}

/// A named, serial execution context. At most one thread runs a dispatcher's
/// events at any moment; distinct dispatchers run concurrently on the worker
/// pool.
pub struct Dispatcher {
    pub(crate) this: Weak<Dispatcher>,
    pub(crate) service: Arc<EventService>,
    name: String,
    pub(crate) events: Mutex<BTreeMap<(i64, u64), Arc<Event>>>,
    pub(crate) state: Mutex<DispatcherState>,
    pub(crate) cond: pmr_mem::Cond,
    pub(crate) required_worker: Mutex<Option<Arc<Worker>>>,
}

impl Dispatcher {
    pub(crate) fn new(service: Arc<EventService>, name: &str, enabled: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            service,
            name: name.to_string(),
            events: Mutex::new(BTreeMap::new()),
            state: Mutex::new(DispatcherState {
                queue: RunQ::None,
                enabled,
                destroyed: false,
                waiting: false,
                owner: None,
            }),
            cond: pmr_mem::Cond::new(),
            required_worker: Mutex::new(None),
        })
    }

    /// Strong handle to this dispatcher for queue membership. `None` only
    /// while the dispatcher is torn down.
    pub(crate) fn arc(&self) -> Option<Arc<Dispatcher>> {
        self.this.upgrade()
    }

    /// Diagnostic dispatcher name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether the dispatcher has any queued events.
    #[must_use]
    pub fn has_events(&self) -> bool {
        !self.events.lock().is_empty()
    }

    /// Due time of the earliest queued event.
    pub(crate) fn earliest_due(&self) -> Option<i64> {
        self.events.lock().keys().next().map(|&(due, _)| due)
    }

    /// Schedules a new event on this dispatcher. `delay_ms` is both the initial
    /// delay and, for [`EventFlags::CONTINUOUS`] events, the reschedule period.
    pub fn create_event(
        &self,
        name: &str,
        delay_ms: i64,
        flags: EventFlags,
        proc_: impl Fn(&Arc<Event>) + Send + Sync + 'static,
    ) -> Arc<Event> {
        let proc_: EventProc = Arc::new(proc_);
        let now = self.service.refresh_now();
        let event = Event::new(
            name,
            now + delay_ms.max(0),
            delay_ms.max(0),
            flags,
            proc_,
            self.this.clone(),
        );
        self.queue_event(&event);
        event
    }

    /// Inserts an event and reschedules the dispatcher.
    pub(crate) fn queue_event(&self, event: &Arc<Event>) {
        {
            let mut events = self.events.lock();
            events.insert(event.key(), Arc::clone(event));
        }
        *event.dispatcher.lock() = self.this.clone();
        self.schedule();
    }

    /// Removes a queued event. A running event is not interrupted, but a
    /// continuous event is prevented from rescheduling.
    pub fn remove_event(&self, event: &Arc<Event>) {
        event.clear_continuous();
        if !event.is_running() {
            self.events.lock().remove(&event.key());
        }
        self.schedule();
    }

    /// Pops the earliest event if it is due at `now`.
    pub(crate) fn pop_due(&self, now: i64) -> Option<Arc<Event>> {
        let mut events = self.events.lock();
        let (&key, _) = events.first_key_value()?;
        if key.0 > now {
            return None;
        }
        events.remove(&key)
    }

    /// Runs due events until the queue drains or the dispatcher is disabled.
    /// The caller must have the dispatcher in the run state.
    pub(crate) fn dispatch_events(&self) -> usize {
        trace!("dispatch events for {}", self.name);
        let mut count = 0;
        loop {
            if !self.is_enabled() {
                break;
            }
            let now = self.service.now();
            let Some(event) = self.pop_due(now) else {
                break;
            };
            trace!("call event {}", event.name());
            event.set_running(true);
            (event.proc_)(&event);
            event.set_running(false);
            count += 1;

            if event.is_continuous() {
                let now = self.service.refresh_now();
                event.set_due(now + event.period().max(1));
                self.events.lock().insert(event.key(), Arc::clone(&event));
            }
        }
        self.service.add_event_count(count);
        count
    }

    /// Enables the dispatcher and reschedules it if it has due events.
    pub fn enable(&self) {
        let Some(this) = self.arc() else {
            error!("failed to upgrade weak reference to dispatcher");
            return;
        };
        self.service.enable_dispatcher(&this);
    }

    /// Disables the dispatcher: drains queued events and dequeues it.
    pub fn disable(&self) {
        let Some(this) = self.arc() else {
            error!("failed to upgrade weak reference to dispatcher");
            return;
        };
        self.service.disable_dispatcher(&this, false);
    }

    /// Disables and permanently invalidates the dispatcher.
    pub fn destroy(&self) {
        let Some(this) = self.arc() else {
            error!("failed to upgrade weak reference to dispatcher");
            return;
        };
        self.service.disable_dispatcher(&this, true);
    }

    /// Re-evaluates which service queue this dispatcher belongs on.
    pub fn schedule(&self) {
        let Some(this) = self.arc() else {
            error!("failed to upgrade weak reference to dispatcher");
            return;
        };
        self.service.schedule_dispatcher(&this);
    }

    /// Signals a thread blocked in [`Dispatcher::wait_for_event`].
    pub fn signal(&self) {
        self.cond.signal();
    }

    /// Binds a dedicated worker that will always run this dispatcher.
    pub fn dedicate_worker(&self, worker: &Arc<Worker>) {
        *self.required_worker.lock() = Some(Arc::clone(worker));
    }

    /// Releases a previously dedicated worker.
    pub fn release_worker(&self) {
        *self.required_worker.lock() = None;
    }

    /// Runs `proc` as if it were an event on this dispatcher, claiming
    /// ownership for the duration. Used to relay work from a foreign thread.
    pub fn relay_event(&self, proc_: impl FnOnce()) {
        let Some(this) = self.arc() else {
            error!("failed to upgrade weak reference to dispatcher");
            return;
        };
        let thread = std::thread::current().id();
        self.service.make_runnable(&this);
        self.state.lock().owner = Some(thread);
        proc_();
        if self.is_enabled() {
            self.state.lock().owner = None;
            self.service.reschedule_after_run(&this);
        }
    }

    /// Synchronously waits for an event or a [`Dispatcher::signal`] on this
    /// dispatcher. Due events are dispatched on the calling thread while it
    /// owns the dispatcher.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if another thread already waits here; [`Error::Timeout`]
    /// if no event became due and no signal arrived within `timeout`.
    pub fn wait_for_event(&self, timeout: Duration) -> Result<()> {
        let this = self.arc().ok_or_else(|| {
            Error::BadState("failed to upgrade weak reference to dispatcher".to_string())
        })?;
        let service = &self.service;
        let heap = service.heap();
        let thread = std::thread::current().id();
        let mut now = service.refresh_now();
        let expires = now + i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let (was_running, run_events) = {
            let _inner = service.lock_inner();
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(Error::BadState("dispatcher destroyed".to_string()));
            }
            if state.waiting {
                return Err(Error::Busy("dispatcher already has a waiter".to_string()));
            }
            let was_running = state.queue == RunQ::Run;
            let run_events = !was_running || state.owner == Some(thread);
            if run_events {
                state.owner = Some(thread);
            }
            (was_running, run_events)
        };
        if run_events && !was_running {
            self.service.make_runnable(&this);
        }

        let mut signalled = false;
        while now <= expires {
            if run_events {
                self.service.make_runnable(&this);
                if self.dispatch_events() > 0 {
                    signalled = true;
                    break;
                }
            }
            let delay = {
                let _inner = service.lock_inner();
                let mut state = self.state.lock();
                state.waiting = true;
                self.idle_delay(expires - now)
            };

            heap.yield_control(YieldFlags::STICKY | YieldFlags::NO_BLOCK);
            let woke = self.cond.wait(Some(Duration::from_millis(
                u64::try_from(delay).unwrap_or(0),
            )));
            heap.reset_yield();
            self.state.lock().waiting = false;

            if woke {
                if run_events {
                    self.service.make_runnable(&this);
                    self.dispatch_events();
                }
                signalled = true;
                break;
            }
            now = service.refresh_now();
        }
        self.state.lock().waiting = false;

        if !was_running {
            self.state.lock().owner = None;
            self.service.reschedule_after_run(&this);
        }
        if signalled { Ok(()) } else { Err(Error::Timeout) }
    }

    /// Milliseconds until this dispatcher's earliest event is due, clipped to
    /// `cap`.
    pub(crate) fn idle_delay(&self, cap: i64) -> i64 {
        let cap = cap.max(0);
        match self.earliest_due() {
            Some(due) => (due - self.service.now()).clamp(0, cap),
            None => cap,
        }
    }
}
