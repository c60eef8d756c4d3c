//! The wait service: `poll(2)` over registered socket handlers.
//!
//! Implements the dispatch notifier so the event loop sleeps here: it wakes on
//! descriptor readiness, on scheduled work (via the self-pipe), or immediately
//! when a handler has been recalled because a provider buffered data.

use crate::error::{Error, Result};
use bitflags::bitflags;
use dashmap::DashMap;
use pmr_dispatch::{Dispatcher, EventFlags, Notifier};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::trace;

bitflags! {
    /// I/O readiness interest and delivery mask.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct IoMask: u32 {
        const READABLE = 0x1;
        const WRITABLE = 0x2;
    }
}

/// Callback invoked (as a dispatcher event) when a handler fires.
pub type WaitProc = Arc<dyn Fn(IoMask) + Send + Sync>;

/// Interest registration for one descriptor. Delivery is one-shot: the
/// interest mask clears when the event is queued and must be re-armed.
pub struct WaitHandler {
    pub(crate) fd: RawFd,
    desired: AtomicU32,
    recalled: AtomicBool,
    dispatcher: Arc<Dispatcher>,
    proc_: WaitProc,
}

impl WaitHandler {
    /// Current interest mask.
    #[must_use]
    pub fn desired(&self) -> IoMask {
        IoMask::from_bits_truncate(self.desired.load(Ordering::Acquire))
    }
}

/// Poll-backed I/O readiness service with a self-pipe wakeup.
pub struct WaitService {
    handlers: DashMap<RawFd, Arc<WaitHandler>>,
    wake_read: RawFd,
    wake_write: RawFd,
}

impl WaitService {
    pub(crate) fn new() -> Result<Self> {
        let mut fds = [0; 2];
        // Safety: fds points at two writable ints.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::CantCreate(format!(
                "wait pipe: {}",
                std::io::Error::last_os_error()
            )));
        }
        for fd in fds {
            // Safety: fd is a fresh pipe end owned by us.
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            handlers: DashMap::new(),
            wake_read: fds[0],
            wake_write: fds[1],
        })
    }

    /// Registers interest in `fd`. The proc runs as an event on `dispatcher`
    /// whenever readiness (or a recall) is delivered.
    pub fn add_handler(
        &self,
        fd: RawFd,
        mask: IoMask,
        dispatcher: &Arc<Dispatcher>,
        proc_: WaitProc,
    ) -> Arc<WaitHandler> {
        let handler = Arc::new(WaitHandler {
            fd,
            desired: AtomicU32::new(mask.bits()),
            recalled: AtomicBool::new(false),
            dispatcher: Arc::clone(dispatcher),
            proc_,
        });
        self.handlers.insert(fd, Arc::clone(&handler));
        self.wake();
        handler
    }

    /// Re-arms a handler's interest mask.
    pub fn enable_handler(&self, handler: &Arc<WaitHandler>, mask: IoMask) {
        handler.desired.store(mask.bits(), Ordering::Release);
        self.wake();
    }

    /// Removes a handler.
    pub fn remove_handler(&self, handler: &Arc<WaitHandler>) {
        self.handlers.remove(&handler.fd);
        self.wake();
    }

    /// Marks a handler for immediate delivery on the next wait, regardless of
    /// descriptor readiness.
    pub fn recall_handler(&self, handler: &Arc<WaitHandler>) {
        handler.recalled.store(true, Ordering::Release);
        self.wake();
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn poll_once(&self, timeout: Duration) {
        let mut entries: Vec<Arc<WaitHandler>> = Vec::with_capacity(self.handlers.len());
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(self.handlers.len() + 1);
        fds.push(libc::pollfd {
            fd: self.wake_read,
            events: libc::POLLIN,
            revents: 0,
        });
        let mut has_recalled = false;
        for entry in self.handlers.iter() {
            let handler = entry.value();
            let desired = handler.desired();
            let recalled = handler.recalled.load(Ordering::Acquire);
            if desired.is_empty() && !recalled {
                continue;
            }
            has_recalled |= recalled;
            let mut events = 0i16;
            if desired.contains(IoMask::READABLE) {
                events |= libc::POLLIN;
            }
            if desired.contains(IoMask::WRITABLE) {
                events |= libc::POLLOUT;
            }
            fds.push(libc::pollfd {
                fd: handler.fd,
                events,
                revents: 0,
            });
            entries.push(Arc::clone(handler));
        }

        let timeout_ms = if has_recalled {
            0
        } else {
            i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
        };
        // Safety: fds is a live array of pollfd for the call's duration.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let error = std::io::Error::last_os_error();
            if error.kind() != std::io::ErrorKind::Interrupted {
                trace!("poll failed: {error}");
            }
            return;
        }

        if fds[0].revents & libc::POLLIN != 0 {
            self.drain_wake_pipe();
        }

        for (index, handler) in entries.iter().enumerate() {
            let revents = fds[index + 1].revents;
            let desired = handler.desired();
            let mut mask = IoMask::empty();
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                mask |= IoMask::READABLE & desired;
            }
            if revents & libc::POLLOUT != 0 {
                mask |= IoMask::WRITABLE & desired;
            }
            if handler.recalled.swap(false, Ordering::AcqRel) {
                // Recalled delivery carries the full interest mask
                mask |= if desired.is_empty() { IoMask::READABLE } else { desired };
            }
            if mask.is_empty() {
                continue;
            }
            // One-shot: interest clears until explicitly re-armed
            handler.desired.store(0, Ordering::Release);
            let proc_ = Arc::clone(&handler.proc_);
            handler
                .dispatcher
                .create_event("io", 0, EventFlags::empty(), move |_event| {
                    proc_(mask);
                });
        }
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            // Safety: reading our own non-blocking pipe end into a local buffer.
            let rc = unsafe {
                libc::read(self.wake_read, buf.as_mut_ptr().cast(), buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Notifier for WaitService {
    fn wait_for_io(&self, timeout: Duration) {
        self.poll_once(timeout);
    }

    fn wake(&self) {
        let byte = 1u8;
        // Safety: writing one byte from a local to our own pipe end.
        unsafe {
            libc::write(self.wake_write, (&raw const byte).cast(), 1);
        }
    }
}

impl Drop for WaitService {
    fn drop(&mut self) {
        // Safety: the pipe ends are owned by this service.
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_mask_bits() {
        let mask = IoMask::READABLE | IoMask::WRITABLE;
        assert!(mask.contains(IoMask::READABLE));
        assert!(mask.contains(IoMask::WRITABLE));
        assert!(!IoMask::empty().contains(IoMask::READABLE));
    }
}
