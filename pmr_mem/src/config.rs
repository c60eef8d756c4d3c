//! Configuration and statistics for the memory service.

use std::time::Duration;

/// Memory depletion policy applied when the configured limit is exceeded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MemoryPolicy {
    /// Terminate the process with exit code 2
    #[default]
    Exit,
    /// Re-exec the process image
    Restart,
    /// Record the error and continue
    Continue,
}

/// Cause passed to the memory notifier and the exception path.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemCause {
    /// The operating system refused the request
    Fail,
    /// The request exceeds the internal maximum
    TooBig,
    /// The request exceeds the configured maximum
    Limit,
    /// The red-line was crossed
    Warning,
}

/// Memory notifier callback: `(cause, policy, size, used)`.
pub type MemNotifier = Box<dyn Fn(MemCause, MemoryPolicy, usize, usize) + Send + Sync>;

/// Configuration for the heap and collector
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Size of a backing region requested from the OS. Rounded up to the system page size.
    pub region_size: usize,
    /// Allocation work accumulated before a collection is considered worthwhile
    pub work_quota: usize,
    /// How long the collector waits for all threads to yield before aborting a cycle
    pub gc_sync_timeout: Duration,
    /// When `true` the sweep phase runs in parallel with resumed mutator threads
    pub parallel: bool,
    /// Whether the collector runs at all. `PMR_DISABLE_GC=1` forces this off.
    pub enabled: bool,
    /// Heap warn limit in bytes. `0` derives ~90% of system memory.
    pub warn_heap: usize,
    /// Heap hard limit in bytes. `0` means unlimited.
    pub max_heap: usize,
    /// Free-byte high-water mark above which the sweeper coalesces aggressively and
    /// returns empty regions to the OS. `0` derives a small multiple of the region size.
    pub cache_heap: usize,
    /// Free-byte low-water line below which allocation pressure triggers collection.
    /// `0` derives one region.
    pub low_heap: usize,
}

impl Default for Configuration {
    /// Creates a default configuration for the heap.
    /// This sets:
    /// - `region_size` to 256KB
    /// - `work_quota` to 10000 weighted allocations
    /// - `gc_sync_timeout` to 100ms
    /// - `parallel` to `true`
    /// - `enabled` to `true`
    /// - limits to `0` (derived at heap construction)
    fn default() -> Self {
        Self {
            region_size: 256 * 1024,
            work_quota: 10_000,
            gc_sync_timeout: Duration::from_millis(100),
            parallel: true,
            enabled: true,
            warn_heap: 0,
            max_heap: 0,
            cache_heap: 0,
            low_heap: 0,
        }
    }
}

/// Statistics about heap and collector activity
#[derive(Clone, Debug, Default)]
pub struct Statistics {
    /// Bytes currently mapped from the OS across all regions
    pub bytes_allocated: usize,
    /// Bytes currently sitting on free queues
    pub bytes_free: usize,
    /// Allocation requests serviced
    pub requests: usize,
    /// Requests satisfied from a free queue
    pub reuse: usize,
    /// Blocks split during allocation
    pub splits: usize,
    /// Adjacent blocks coalesced during sweep
    pub joins: usize,
    /// Regions returned to the OS
    pub unpins: usize,
    /// Full bitmap rescans after queue contention
    pub retries: usize,
    /// Failed queue try-lock acquisitions
    pub try_fails: usize,
    /// Collection cycles completed
    pub collections: usize,
    /// Collection cycles aborted because threads did not yield in time
    pub aborted_collections: usize,
    /// Blocks swept (freed) over the heap lifetime
    pub swept: usize,
    /// Bytes swept (freed) over the heap lifetime
    pub freed: usize,
    /// Currently warn limit
    pub warn_heap: usize,
    /// Current hard limit
    pub max_heap: usize,
    /// Current cache high-water mark
    pub cache_heap: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.region_size, 256 * 1024);
        assert_eq!(config.work_quota, 10_000);
        assert_eq!(config.gc_sync_timeout, Duration::from_millis(100));
        assert!(config.parallel);
        assert!(config.enabled);
        assert_eq!(config.max_heap, 0);
    }

    #[test]
    fn default_statistics() {
        let stats = Statistics::default();
        assert_eq!(stats.bytes_allocated, 0);
        assert_eq!(stats.bytes_free, 0);
        assert_eq!(stats.collections, 0);
        assert_eq!(stats.swept, 0);
    }

    #[test]
    fn default_policy() {
        assert_eq!(MemoryPolicy::default(), MemoryPolicy::Exit);
    }
}
