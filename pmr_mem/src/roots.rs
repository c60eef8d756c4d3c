//! The root set.
//!
//! An ordered list of heap pointers marked at the start of every cycle. The
//! marker walks the list by index so that concurrent removals cannot skip an
//! entry: removing at or before the cursor pulls the cursor back one slot.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) struct RootSet {
    list: Mutex<Vec<usize>>,
    cursor: AtomicUsize,
}

impl RootSet {
    pub(crate) fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn add(&self, ptr: *const u8) {
        if ptr.is_null() {
            return;
        }
        self.list.lock().push(ptr as usize);
    }

    pub(crate) fn remove(&self, ptr: *const u8) {
        let mut list = self.list.lock();
        if let Some(pos) = list.iter().position(|&root| root == ptr as usize) {
            list.remove(pos);
            // Keep the marker cursor stable across the shift
            let _ = self
                .cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                    if pos < cursor { Some(cursor - 1) } else { None }
                });
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().len()
    }

    /// Iterates the root list, releasing the lock between entries so that mark
    /// callbacks may add or remove roots.
    pub(crate) fn for_each(&self, mut visit: impl FnMut(*const u8)) {
        self.cursor.store(0, Ordering::Release);
        loop {
            let root = {
                let list = self.list.lock();
                let cursor = self.cursor.load(Ordering::Acquire);
                if cursor >= list.len() {
                    break;
                }
                self.cursor.store(cursor + 1, Ordering::Release);
                list[cursor]
            };
            visit(root as *const u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove() {
        let roots = RootSet::new();
        let a = 0x1000 as *const u8;
        let b = 0x2000 as *const u8;
        roots.add(a);
        roots.add(b);
        assert_eq!(roots.len(), 2);
        roots.remove(a);
        assert_eq!(roots.len(), 1);
        roots.remove(a);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn null_is_ignored() {
        let roots = RootSet::new();
        roots.add(std::ptr::null());
        assert_eq!(roots.len(), 0);
    }

    #[test]
    fn removal_during_iteration_does_not_skip() {
        let roots = RootSet::new();
        for addr in 1..=4usize {
            roots.add((addr * 0x100) as *const u8);
        }
        let mut seen = Vec::new();
        roots.for_each(|ptr| {
            seen.push(ptr as usize);
            if ptr as usize == 0x100 {
                // Removing an earlier entry must not skip the next one
                roots.remove(0x100 as *const u8);
            }
        });
        assert_eq!(seen, vec![0x100, 0x200, 0x300, 0x400]);
    }
}
