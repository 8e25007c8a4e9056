//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering — they are advisory/diagnostic, not
//! synchronization primitives. The hot-path counters are only bumped when
//! the `statistic` feature is on; violation counters are always maintained.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config;

/// Global allocator operation counters.
pub struct AllocatorMetrics {
    /// Allocation entry-point calls.
    pub allocs: AtomicU64,
    /// Free entry-point calls.
    pub frees: AtomicU64,
    /// Allocations promoted to sampled allocations.
    pub sampled_allocs: AtomicU64,
    /// `escape` calls.
    pub escapes: AtomicU64,
    /// `escape` calls whose location resides in heap memory.
    pub escapes_heap: AtomicU64,
    /// `escape` calls whose target resolved to a live chunk.
    pub escapes_valid: AtomicU64,
    /// `escape` calls dropped because the location already pointed into the
    /// same chunk.
    pub escapes_same_chunk: AtomicU64,
    /// Escape records accepted into the write-combining buffer.
    pub escapes_buffered: AtomicU64,
    /// Buffered records dropped at commit because the location had been
    /// overwritten or the span had gone away.
    pub escapes_stale_at_commit: AtomicU64,
    /// Escape records committed into a span's escape list.
    pub escapes_committed: AtomicU64,
    /// Locations poisoned on free.
    pub poisoned_locations: AtomicU64,
    /// `get_chunk_range`/`get_chunk_start`/`get_chunk_end` queries.
    pub chunk_range_queries: AtomicU64,
    /// `gep_check_boundary` calls.
    pub gep_checks: AtomicU64,
    /// `bc_check_boundary` calls.
    pub bc_checks: AtomicU64,
    /// Safety violations reported (always counted).
    pub violations: AtomicU64,
}

impl AllocatorMetrics {
    /// Creates a zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            sampled_allocs: AtomicU64::new(0),
            escapes: AtomicU64::new(0),
            escapes_heap: AtomicU64::new(0),
            escapes_valid: AtomicU64::new(0),
            escapes_same_chunk: AtomicU64::new(0),
            escapes_buffered: AtomicU64::new(0),
            escapes_stale_at_commit: AtomicU64::new(0),
            escapes_committed: AtomicU64::new(0),
            poisoned_locations: AtomicU64::new(0),
            chunk_range_queries: AtomicU64::new(0),
            gep_checks: AtomicU64::new(0),
            bc_checks: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Bumps a hot-path counter when statistics are compiled in.
    #[inline]
    pub fn tick(counter: &AtomicU64) {
        if config::statistic_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Bumps a counter unconditionally.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            allocs: get(&self.allocs),
            frees: get(&self.frees),
            sampled_allocs: get(&self.sampled_allocs),
            escapes: get(&self.escapes),
            escapes_heap: get(&self.escapes_heap),
            escapes_valid: get(&self.escapes_valid),
            escapes_same_chunk: get(&self.escapes_same_chunk),
            escapes_buffered: get(&self.escapes_buffered),
            escapes_stale_at_commit: get(&self.escapes_stale_at_commit),
            escapes_committed: get(&self.escapes_committed),
            poisoned_locations: get(&self.poisoned_locations),
            chunk_range_queries: get(&self.chunk_range_queries),
            gep_checks: get(&self.gep_checks),
            bc_checks: get(&self.bc_checks),
            violations: get(&self.violations),
        }
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of the allocator counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub sampled_allocs: u64,
    pub escapes: u64,
    pub escapes_heap: u64,
    pub escapes_valid: u64,
    pub escapes_same_chunk: u64,
    pub escapes_buffered: u64,
    pub escapes_stale_at_commit: u64,
    pub escapes_committed: u64,
    pub poisoned_locations: u64,
    pub chunk_range_queries: u64,
    pub gep_checks: u64,
    pub bc_checks: u64,
    pub violations: u64,
}

/// Global metrics instance.
static GLOBAL_METRICS: AllocatorMetrics = AllocatorMetrics::new();

/// Accesses the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static AllocatorMetrics {
    &GLOBAL_METRICS
}

/// Emits the statistic snapshot through `tracing`.
pub fn report_statistics() {
    let s = global_metrics().snapshot();
    tracing::info!(
        "allocator statistics: allocs={} frees={} sampled={} escapes={} \
         escapes_heap={} escapes_valid={} same_chunk={} buffered={} \
         stale_at_commit={} committed={} poisoned={} chunk_queries={} \
         gep_checks={} bc_checks={} violations={}",
        s.allocs,
        s.frees,
        s.sampled_allocs,
        s.escapes,
        s.escapes_heap,
        s.escapes_valid,
        s.escapes_same_chunk,
        s.escapes_buffered,
        s.escapes_stale_at_commit,
        s.escapes_committed,
        s.poisoned_locations,
        s.chunk_range_queries,
        s.gep_checks,
        s.bc_checks,
        s.violations,
    );
}
