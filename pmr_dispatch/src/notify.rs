//! The I/O notifier seam.
//!
//! `service_events` parks here when no event is due. The default notifier is a
//! plain condvar sleeper; an I/O layer installs its own implementation so the
//! event loop wakes on descriptor readiness as well as on scheduled work.

use pmr_mem::Cond;
use std::time::Duration;

/// Blocks the event loop until work arrives or the timeout expires.
pub trait Notifier: Send + Sync {
    /// Parks the calling thread for up to `timeout`.
    fn wait_for_io(&self, timeout: Duration);

    /// Wakes a parked [`Notifier::wait_for_io`] call.
    fn wake(&self);
}

/// Default notifier: a latched condvar with no I/O awareness.
pub struct CondNotifier {
    cond: Cond,
}

impl CondNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self { cond: Cond::new() }
    }
}

impl Default for CondNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for CondNotifier {
    fn wait_for_io(&self, timeout: Duration) {
        self.cond.wait(Some(timeout));
    }

    fn wake(&self) {
        self.cond.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wake_interrupts_wait() {
        let notifier = Arc::new(CondNotifier::new());
        let waker = Arc::clone(&notifier);
        let start = Instant::now();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.wake();
        });
        notifier.wait_for_io(Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().expect("waker");
    }

    #[test]
    fn wait_times_out() {
        let notifier = CondNotifier::new();
        let start = Instant::now();
        notifier.wait_for_io(Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
