//! Trigger-style condition variable.
//!
//! A signal is latched until consumed by a waiter, so a signal delivered before
//! the waiter blocks is not lost.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Latched condition used for GC resume, dispatcher signalling and worker wakeup.
pub struct Cond {
    triggered: Mutex<bool>,
    cvar: Condvar,
}

impl Cond {
    #[must_use]
    pub fn new() -> Self {
        Self {
            triggered: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Latches the trigger and wakes one waiter.
    pub fn signal(&self) {
        let mut triggered = self.triggered.lock();
        *triggered = true;
        self.cvar.notify_one();
    }

    /// Waits until signalled or until `timeout` elapses (`None` waits forever).
    /// Consumes the trigger. Returns `true` if signalled.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut triggered = self.triggered.lock();
        while !*triggered {
            match deadline {
                Some(deadline) => {
                    if self.cvar.wait_until(&mut triggered, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cvar.wait(&mut triggered),
            }
        }
        let signalled = *triggered;
        *triggered = false;
        signalled
    }

    /// Clears a latched trigger without waiting.
    pub fn reset(&self) {
        *self.triggered.lock() = false;
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_latched() {
        let cond = Cond::new();
        cond.signal();
        assert!(cond.wait(Some(Duration::from_millis(1))));
        // Trigger was consumed
        assert!(!cond.wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn wait_times_out() {
        let cond = Cond::new();
        assert!(!cond.wait(Some(Duration::from_millis(5))));
    }

    #[test]
    fn cross_thread_signal() {
        let cond = Arc::new(Cond::new());
        let signaller = Arc::clone(&cond);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal();
        });
        assert!(cond.wait(Some(Duration::from_secs(5))));
        handle.join().expect("signaller");
    }
}
