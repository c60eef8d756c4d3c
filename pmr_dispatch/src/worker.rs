//! The worker pool: bounded, reusable threads that run dispatcher work.

use crate::error::{Error, Result};
use crate::service::EventService;
use parking_lot::Mutex;
use pmr_mem::{Cond, Heap, ThreadRecord, YieldFlags};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use thread_priority::{ThreadPriority, ThreadPriorityValue};
use tracing::{debug, trace, warn};

/// Workers idle longer than this are pruned down to the pool minimum.
pub const PRUNE_TIMEOUT_MS: i64 = 60_000;

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Abstract worker priority on a 0-99 scale, 50 being normal.
pub const DEFAULT_PRIORITY: u8 = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Busy,
    Idle,
    Pruned,
}

/// Work assigned to a worker.
pub type WorkerProc = Box<dyn FnOnce(&Arc<Worker>) + Send + 'static>;

/// A reusable pool thread.
pub struct Worker {
    id: usize,
    state: AtomicU8,
    proc_slot: Mutex<Option<WorkerProc>>,
    pub(crate) idle_cond: Cond,
    last_activity: AtomicI64,
    /// Set by the worker thread itself once it registers with the heap
    record: OnceLock<Arc<ThreadRecord>>,
}

impl Worker {
    fn new(id: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(state_to_u8(WorkerState::Busy)),
            proc_slot: Mutex::new(None),
            idle_cond: Cond::new(),
            last_activity: AtomicI64::new(0),
            record: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state_to_u8(state), Ordering::Release);
    }

    /// Milliseconds (service ticks) of the last completed work item.
    #[must_use]
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Acquire)
    }

    fn is_yielded(&self) -> bool {
        self.record.get().is_some_and(|record| record.is_yielded())
    }
}

/// Pool statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    pub min: usize,
    pub max: usize,
    pub busy: usize,
    pub idle: usize,
    /// Busy workers currently yielded to the collector
    pub yielded: usize,
    pub total: usize,
    pub max_used: usize,
}

struct WorkerInner {
    idle: Vec<Arc<Worker>>,
    busy: Vec<Arc<Worker>>,
    num_threads: usize,
    max_used: usize,
    next_id: usize,
    stopping: bool,
}

/// Keeps between `min` and `max` workers, reusing the most recently idle one
/// first so the pruner can retire the cold tail.
pub struct WorkerService {
    heap: Arc<Heap>,
    service: Weak<EventService>,
    inner: Mutex<WorkerInner>,
    min: AtomicUsize,
    max: AtomicUsize,
    stack_size: AtomicUsize,
    priority: AtomicU8,
    prune_timeout_ms: AtomicI64,
}

impl WorkerService {
    pub(crate) fn new(heap: Arc<Heap>, service: Weak<EventService>) -> Self {
        Self {
            heap,
            service,
            inner: Mutex::new(WorkerInner {
                idle: Vec::new(),
                busy: Vec::new(),
                num_threads: 0,
                max_used: 0,
                next_id: 0,
                stopping: false,
            }),
            min: AtomicUsize::new(0),
            max: AtomicUsize::new(DEFAULT_MAX_WORKERS),
            stack_size: AtomicUsize::new(DEFAULT_STACK_SIZE),
            priority: AtomicU8::new(DEFAULT_PRIORITY),
            prune_timeout_ms: AtomicI64::new(PRUNE_TIMEOUT_MS),
        }
    }

    /// Sets the minimum pool size kept across pruning.
    pub fn set_min_workers(&self, min: usize) {
        self.min.store(min, Ordering::Relaxed);
    }

    /// Sets the maximum pool size.
    pub fn set_max_workers(&self, max: usize) {
        self.max.store(max.max(1), Ordering::Relaxed);
    }

    /// Sets the stack size for new worker threads.
    pub fn set_stack_size(&self, size: usize) {
        self.stack_size.store(size, Ordering::Relaxed);
    }

    /// Sets worker priority on the abstract 0-99 scale.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority.min(99), Ordering::Relaxed);
    }

    /// Sets how long a worker may sit idle before the pruner retires it.
    pub fn set_prune_timeout(&self, timeout: Duration) {
        self.prune_timeout_ms.store(
            i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            Ordering::Relaxed,
        );
    }

    /// Dispatches `proc` onto an idle worker, spawning one if the pool has
    /// headroom.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when the pool is saturated; the caller should queue the
    /// work and retry when a worker frees up.
    pub fn start_worker(&self, proc_: WorkerProc) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stopping {
            return Err(Error::BadState("worker pool stopping".to_string()));
        }
        // Most recently used idle worker first, so cold workers age out
        if let Some(worker) = inner.idle.pop() {
            inner.busy.push(Arc::clone(&worker));
            worker.set_state(WorkerState::Busy);
            *worker.proc_slot.lock() = Some(proc_);
            worker.idle_cond.signal();
            return Ok(());
        }
        let max = self.max.load(Ordering::Relaxed);
        if inner.num_threads < max {
            if self.available_locked(&inner) == 0 {
                return Err(Error::Busy("no spare cores for another worker".to_string()));
            }
            let worker = Worker::new(inner.next_id);
            inner.next_id += 1;
            inner.num_threads += 1;
            inner.max_used = inner.max_used.max(inner.num_threads);
            *worker.proc_slot.lock() = Some(proc_);
            inner.busy.push(Arc::clone(&worker));
            if let Err(error) = self.spawn_worker(&worker) {
                inner.busy.retain(|entry| !Arc::ptr_eq(entry, &worker));
                inner.num_threads -= 1;
                return Err(error);
            }
            return Ok(());
        }
        Err(Error::Busy("worker pool at maximum".to_string()))
    }

    /// Assigns work to a specific (dedicated) worker. Returns `false` if the
    /// worker is not idle.
    pub(crate) fn activate(&self, worker: &Arc<Worker>, proc_: WorkerProc) -> bool {
        let mut inner = self.inner.lock();
        let Some(index) = inner
            .idle
            .iter()
            .position(|entry| Arc::ptr_eq(entry, worker))
        else {
            return false;
        };
        let worker = inner.idle.remove(index);
        inner.busy.push(Arc::clone(&worker));
        worker.set_state(WorkerState::Busy);
        *worker.proc_slot.lock() = Some(proc_);
        worker.idle_cond.signal();
        true
    }

    fn spawn_worker(&self, worker: &Arc<Worker>) -> Result<()> {
        let Some(service) = self.service.upgrade() else {
            return Err(Error::BadState("event service gone".to_string()));
        };
        let heap = Arc::clone(&self.heap);
        let priority = self.priority.load(Ordering::Relaxed);
        let thread_worker = Arc::clone(worker);
        let builder = std::thread::Builder::new()
            .name(format!("pmr-worker-{}", worker.id()))
            .stack_size(self.stack_size.load(Ordering::Relaxed));
        match builder.spawn(move || worker_main(&heap, &service, &thread_worker, priority)) {
            Ok(_) => Ok(()),
            Err(error) => {
                warn!("cannot create worker thread: {error}");
                Err(Error::CantCreate("worker thread".to_string()))
            }
        }
    }

    /// Workers that could take on new work right now:
    /// `idle + min(max - busy - idle, cores - (busy - yielded))`. Workers
    /// yielded to the collector do not count against the CPU budget.
    #[must_use]
    pub fn available_workers(&self) -> usize {
        self.available_locked(&self.inner.lock())
    }

    fn available_locked(&self, inner: &WorkerInner) -> usize {
        let max = self.max.load(Ordering::Relaxed);
        let busy = inner.busy.len();
        let idle = inner.idle.len();
        let yielded = inner.busy.iter().filter(|worker| worker.is_yielded()).count();
        let spare_threads = max.saturating_sub(busy + idle);
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let active = busy.saturating_sub(yielded);
        let spare_cores = cores.saturating_sub(active);
        idle + spare_threads.min(spare_cores)
    }

    /// Pool statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        let inner = self.inner.lock();
        WorkerStats {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            busy: inner.busy.len(),
            idle: inner.idle.len(),
            yielded: inner.busy.iter().filter(|worker| worker.is_yielded()).count(),
            total: inner.num_threads,
            max_used: inner.max_used,
        }
    }

    /// Retires workers idle longer than the prune timeout, keeping at least
    /// the configured minimum.
    pub fn prune(&self) {
        let now = self
            .service
            .upgrade()
            .map_or(0, |service| service.refresh_now());
        let timeout = self.prune_timeout_ms.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let mut pruned = 0;
        {
            let mut inner = self.inner.lock();
            let mut index = 0;
            while index < inner.idle.len() {
                if inner.num_threads.saturating_sub(pruned) <= min {
                    break;
                }
                let worker = Arc::clone(&inner.idle[index]);
                if worker.last_activity() + timeout < now {
                    worker.set_state(WorkerState::Pruned);
                    inner.idle.remove(index);
                    worker.idle_cond.signal();
                    pruned += 1;
                } else {
                    index += 1;
                }
            }
        }
        if pruned > 0 {
            debug!("pruned {pruned} workers");
        }
    }

    /// Retires every worker. Busy workers exit after their current item.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopping = true;
        for worker in inner.idle.iter().chain(inner.busy.iter()) {
            worker.set_state(WorkerState::Pruned);
            worker.idle_cond.signal();
        }
    }

    /// Moves a worker from busy to idle after it finishes a work item.
    fn make_idle(&self, worker: &Arc<Worker>) {
        let mut inner = self.inner.lock();
        inner.busy.retain(|entry| !Arc::ptr_eq(entry, worker));
        if worker.state() == WorkerState::Pruned || inner.stopping {
            return;
        }
        worker.set_state(WorkerState::Idle);
        inner.idle.push(Arc::clone(worker));
        drop(inner);
        if let Some(service) = self.service.upgrade() {
            service.wake_if_pending();
        }
    }

    /// Final bookkeeping when a worker thread exits.
    fn remove_worker(&self, worker: &Arc<Worker>) {
        let mut inner = self.inner.lock();
        inner.busy.retain(|entry| !Arc::ptr_eq(entry, worker));
        inner.idle.retain(|entry| !Arc::ptr_eq(entry, worker));
        inner.num_threads = inner.num_threads.saturating_sub(1);
        trace!("worker exiting, {} remain in the pool", inner.num_threads);
    }
}

/// Worker thread main loop: run, go idle, sticky-yield, park, repeat.
fn worker_main(
    heap: &Arc<Heap>,
    service: &Arc<EventService>,
    worker: &Arc<Worker>,
    priority: u8,
) {
    heap.register_thread();
    let _ = worker.record.set(heap.current_thread_record());
    worker
        .last_activity
        .store(service.refresh_now(), Ordering::Release);
    if priority != DEFAULT_PRIORITY {
        apply_priority(priority);
    }
    trace!("worker {} started", worker.id());

    loop {
        let proc_ = worker.proc_slot.lock().take();
        if let Some(proc_) = proc_ {
            proc_(worker);
        }
        worker
            .last_activity
            .store(service.refresh_now(), Ordering::Release);
        if worker.state() == WorkerState::Pruned {
            break;
        }
        service.workers().make_idle(worker);
        if worker.state() == WorkerState::Pruned {
            break;
        }

        // Sleep until there is more work. Yield for GC first.
        heap.yield_control(YieldFlags::STICKY | YieldFlags::NO_BLOCK);
        worker.idle_cond.wait(None);
        heap.reset_yield();

        if worker.state() == WorkerState::Pruned {
            break;
        }
    }
    service.workers().remove_worker(worker);
    heap.deregister_thread();
}

/// Maps the abstract 0-99 priority onto the host scheduler.
fn apply_priority(priority: u8) {
    match ThreadPriorityValue::try_from(priority) {
        Ok(value) => {
            if let Err(error) =
                thread_priority::set_current_thread_priority(ThreadPriority::Crossplatform(value))
            {
                trace!("cannot set worker priority {priority}: {error:?}");
            }
        }
        Err(error) => trace!("invalid worker priority {priority}: {error:?}"),
    }
}

fn state_to_u8(state: WorkerState) -> u8 {
    match state {
        WorkerState::Busy => 0,
        WorkerState::Idle => 1,
        WorkerState::Pruned => 2,
    }
}

fn state_from_u8(value: u8) -> WorkerState {
    match value {
        1 => WorkerState::Idle,
        2 => WorkerState::Pruned,
        _ => WorkerState::Busy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        for state in [WorkerState::Busy, WorkerState::Idle, WorkerState::Pruned] {
            assert_eq!(state_from_u8(state_to_u8(state)), state);
        }
    }
}
