//! Allocation entry points and process-wide state.
//!
//! The fast allocation path is size-class lookup → sampler "no sample" →
//! thread-cache pop. Everything else (refills, large objects, sampling,
//! the instrumented free path) funnels through the slower routines here.
//! Policy choices (alignment, access hint, nothrow) travel as a small
//! value so one generic allocation routine serves every entry point.
//!
//! Process-wide state is a single `Globals` value built on first touch;
//! initialization is idempotent under contention.

#![allow(unsafe_code)]

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::config;
use crate::error::{self, report_violation, AllocError, SafetyViolation};
use crate::escape;
use crate::guarded::GuardedPageAllocator;
use crate::metrics::{global_metrics, AllocatorMetrics};
use crate::page_allocator::PageHeap;
use crate::pagemap::{packed_class, packed_first_page, PageMap};
use crate::pages::{page_containing, page_start, pages_for, MemoryTag, PAGE_SIZE};
use crate::region::SystemRegionFactory;
use crate::sampler::with_sampler;
use crate::size_map::{AccessHint, SizeMap};
use crate::span::{SampledAllocation, Span, SpanKind, SpanState};
use crate::thread_cache::with_thread_cache;
use crate::transfer_cache::TransferCache;

/// Chunk-end value reported for addresses outside heap-owned memory.
pub const NON_HEAP_SENTINEL: usize = 0x1_0000_0000_0000;

/// Who owns an address, as reported to introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    NotOwned,
}

/// Per-call allocation policy: alignment, access hint, OOM behavior.
///
/// The default is malloc-like: 8-byte alignment, hot access, null on
/// exhaustion. `throwing()` routes exhaustion to the OOM handler instead.
#[derive(Debug, Clone, Copy)]
pub struct AllocPolicy {
    align: usize,
    access: AccessHint,
    nothrow: bool,
}

impl Default for AllocPolicy {
    fn default() -> Self {
        Self {
            align: 8,
            access: AccessHint::Hot,
            nothrow: true,
        }
    }
}

impl AllocPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn align_as(mut self, align: usize) -> Self {
        self.align = align.max(1);
        self
    }

    #[must_use]
    pub fn cold(mut self) -> Self {
        self.access = AccessHint::Cold;
        self
    }

    #[must_use]
    pub fn hot(mut self) -> Self {
        self.access = AccessHint::Hot;
        self
    }

    /// Exhaustion invokes the OOM handler instead of returning null.
    #[must_use]
    pub fn throwing(mut self) -> Self {
        self.nothrow = false;
        self
    }

    #[must_use]
    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn access(&self) -> AccessHint {
        self.access
    }
}

struct ReleaseState {
    /// Bytes released beyond what callers asked for; later release calls
    /// draw down this balance first so the release rate stays constant.
    extra_bytes_released: usize,
}

/// Registry of live sampled allocations.
pub struct SampleRecorder {
    samples: Mutex<HashMap<u64, Arc<SampledAllocation>>>,
    next_id: AtomicU64,
}

impl SampleRecorder {
    fn new() -> Self {
        Self {
            samples: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, sa: Arc<SampledAllocation>) {
        self.samples.lock().insert(sa.id, sa);
    }

    fn unregister(&self, id: u64) {
        self.samples.lock().remove(&id);
    }

    /// Number of live sampled allocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every live sampled allocation.
    pub fn iterate(&self, mut f: impl FnMut(&SampledAllocation)) {
        for sa in self.samples.lock().values() {
            f(sa);
        }
    }
}

/// Process-wide allocator state.
pub struct Globals {
    pub(crate) sizemap: SizeMap,
    pub(crate) pagemap: PageMap,
    pub(crate) page_heap: Mutex<PageHeap>,
    pub(crate) transfer_cache: TransferCache,
    pub(crate) guarded: GuardedPageAllocator,
    recorder: SampleRecorder,
    release: Mutex<ReleaseState>,
}

impl Globals {
    fn new() -> Self {
        Self {
            sizemap: SizeMap::new(),
            pagemap: PageMap::new(),
            page_heap: Mutex::new(PageHeap::new(Arc::new(SystemRegionFactory::new()))),
            transfer_cache: TransferCache::new(),
            guarded: GuardedPageAllocator::new(),
            recorder: SampleRecorder::new(),
            release: Mutex::new(ReleaseState {
                extra_bytes_released: 0,
            }),
        }
    }

    /// The sampled-allocation recorder.
    #[must_use]
    pub fn sample_recorder(&self) -> &SampleRecorder {
        &self.recorder
    }
}

static GLOBALS: OnceLock<Globals> = OnceLock::new();

/// First-touch initialized process globals.
#[must_use]
pub fn globals() -> &'static Globals {
    GLOBALS.get_or_init(Globals::new)
}

/// The globals, only if some thread already initialized them. Teardown
/// paths use this so they never initialize the allocator while the
/// process is unwinding.
#[must_use]
pub(crate) fn globals_if_inited() -> Option<&'static Globals> {
    GLOBALS.get()
}

/// The 1-byte pad disambiguates a one-past-the-end pointer from the next
/// chunk when escape tracking is on. Applied to the size-class lookup
/// only; the page path sizes spans from the unpadded request.
#[inline]
fn padded(size: usize) -> usize {
    if config::protection_enabled() {
        size + 1
    } else {
        size
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// `alloc(size)` with the default policy.
#[must_use]
pub fn allocate(size: usize) -> Option<usize> {
    allocate_with(AllocPolicy::default(), size)
}

/// `alloc(size, align, access_hint, nothrow)`.
#[must_use]
pub fn allocate_with(policy: AllocPolicy, size: usize) -> Option<usize> {
    match do_allocate(policy, size, false) {
        Ok((addr, _)) => Some(addr),
        Err(_) if policy.nothrow => None,
        Err(_) => error::handle_oom(size),
    }
}

/// Size-feedback allocation: returns `(address, usable capacity)`.
#[must_use]
pub fn allocate_sized(policy: AllocPolicy, size: usize) -> Option<(usize, usize)> {
    match do_allocate(policy, size, true) {
        Ok(out) => Some(out),
        Err(_) if policy.nothrow => None,
        Err(_) => error::handle_oom(size),
    }
}

/// Full-fidelity entry: every failure is typed.
pub fn do_allocate(
    policy: AllocPolicy,
    size: usize,
    size_returning: bool,
) -> Result<(usize, usize), AllocError> {
    if !policy.align.is_power_of_two() {
        return Err(AllocError::InvalidAlignment(policy.align));
    }
    if size > usize::MAX - PAGE_SIZE {
        return Err(AllocError::SizeOverflow);
    }
    let g = globals();
    AllocatorMetrics::tick(&global_metrics().allocs);

    match g.sizemap.size_class(padded(size), policy.align, policy.access) {
        Some(class) => alloc_small(g, policy, class, size, size_returning),
        None => alloc_pages(g, policy, size, size_returning),
    }
}

fn alloc_small(
    g: &'static Globals,
    policy: AllocPolicy,
    class: u32,
    size: usize,
    size_returning: bool,
) -> Result<(usize, usize), AllocError> {
    let obj = with_thread_cache(|tc| {
        tc.allocate(
            &g.sizemap,
            &g.pagemap,
            &g.page_heap,
            &g.transfer_cache,
            class,
        )
    })
    .flatten()
    .or_else(|| {
        // The thread-local cache is gone (thread teardown); pull straight
        // from the central list.
        g.transfer_cache
            .remove_range(&g.sizemap, &g.pagemap, &g.page_heap, class, 1)
            .pop()
    })
    .ok_or(AllocError::Exhausted)?;

    let weight = with_sampler(|s| s.record_allocation(size));
    if weight > 0 {
        return Ok(sampleify_small(
            g,
            policy,
            size,
            weight,
            class,
            obj,
            size_returning,
        ));
    }
    Ok((obj, g.sizemap.class_to_size(class)))
}

fn alloc_pages(
    g: &'static Globals,
    policy: AllocPolicy,
    size: usize,
    _size_returning: bool,
) -> Result<(usize, usize), AllocError> {
    let num_pages = pages_for(size).max(1);
    let align_pages = pages_for(policy.align).max(1);
    let tag = match policy.access {
        AccessHint::Cold => MemoryTag::Cold,
        AccessHint::Hot => MemoryTag::Normal,
    };

    let span = {
        let mut heap = g.page_heap.lock();
        match heap.new_aligned(&g.pagemap, num_pages, align_pages, tag) {
            Some(span) => span,
            None => {
                let (limit, hard) = heap.limit();
                return Err(if hard && limit < usize::MAX {
                    AllocError::LimitExceeded
                } else {
                    AllocError::Exhausted
                });
            }
        }
    };
    span.set_layout(span.bytes_in_span(), 1);

    let addr = span.start_address();
    let capacity = span.bytes_in_span();

    let weight = with_sampler(|s| s.record_allocation(size));
    if weight > 0 {
        sampleify_pages(g, policy, size, weight, &span);
    }
    Ok((addr, capacity))
}

/// Promotes an already-returned small-class object into a sampled
/// allocation; see the Sampleify protocol.
fn sampleify_small(
    g: &'static Globals,
    policy: AllocPolicy,
    requested: usize,
    weight: usize,
    class: u32,
    obj: usize,
    size_returning: bool,
) -> (usize, usize) {
    let allocated_size = g.sizemap.class_to_size(class);
    let num_pages = pages_for(allocated_size).max(1);

    let mut guarded_addr = None;
    if num_pages == 1 && with_sampler(|s| s.should_sample_guarded()) {
        guarded_addr = g.guarded.allocate(requested.max(1), policy.align);
    }

    let span = match guarded_addr {
        Some(gaddr) => {
            let span = Arc::new(Span::new(
                page_containing(gaddr),
                1,
                SpanKind::Guarded,
                MemoryTag::Guarded,
            ));
            span.set_layout(allocated_size, (PAGE_SIZE / allocated_size) as u32);
            let _heap = g.page_heap.lock();
            g.pagemap.set_range(&span, 0);
            span
        }
        None => {
            let Some(span) = g.page_heap.lock().new_aligned(
                &g.pagemap,
                num_pages,
                1,
                MemoryTag::Sampled,
            ) else {
                // Out of memory while sampling: cheat and hand back the
                // original object as if no sampling was requested.
                return (obj, allocated_size);
            };
            span.set_layout(
                allocated_size,
                (span.bytes_in_span() / allocated_size) as u32,
            );
            span
        }
    };

    // Keep the original object live as a proxy when its span hosts other
    // chunks, so the span stays pinned and fragmentation observable.
    let proxy = if g.sizemap.objects_per_span(class) > 1 {
        Some(obj)
    } else {
        g.transfer_cache
            .insert_range(&g.pagemap, &g.page_heap, class, vec![obj]);
        None
    };

    let sa = Arc::new(SampledAllocation {
        id: g.recorder.next_id(),
        stack: Backtrace::capture(),
        requested_size: requested,
        allocated_size,
        requested_alignment: if policy.align <= 8 { 0 } else { policy.align },
        access: policy.access,
        weight,
        allocation_time: SystemTime::now(),
        proxy,
        span_start: span.start_address(),
    });
    g.recorder.register(Arc::clone(&sa));
    span.sample(sa);
    AllocatorMetrics::bump(&global_metrics().sampled_allocs);

    match guarded_addr {
        Some(gaddr) => {
            // A guarded object is trimmed to the requested size, and the
            // reported capacity must match what `get_size` will say.
            let capacity = if size_returning { requested } else { allocated_size };
            (gaddr, capacity)
        }
        None => (span.start_address(), allocated_size),
    }
}

fn sampleify_pages(
    g: &'static Globals,
    policy: AllocPolicy,
    requested: usize,
    weight: usize,
    span: &Arc<Span>,
) {
    let sa = Arc::new(SampledAllocation {
        id: g.recorder.next_id(),
        stack: Backtrace::capture(),
        requested_size: requested,
        allocated_size: span.bytes_in_span(),
        requested_alignment: if policy.align <= 8 { 0 } else { policy.align },
        access: policy.access,
        weight,
        allocation_time: SystemTime::now(),
        proxy: None,
        span_start: span.start_address(),
    });
    g.recorder.register(Arc::clone(&sa));
    span.sample(sa);
    AllocatorMetrics::bump(&global_metrics().sampled_allocs);
}

// ---------------------------------------------------------------------------
// Free
// ---------------------------------------------------------------------------

/// `free(ptr)`.
pub fn deallocate(addr: usize) {
    if addr == 0 {
        return;
    }
    let g = globals();
    AllocatorMetrics::tick(&global_metrics().frees);

    if config::protection_enabled() && !validate_and_poison(g, addr) {
        return;
    }

    let class = g.pagemap.size_class(page_containing(addr));
    if class != 0 {
        free_small(g, addr, class);
    } else {
        free_pages(g, addr);
    }
}

/// `free_sized(ptr, size, align)`: asserts the size matches and may derive
/// the class from the SizeMap instead of the page map.
pub fn deallocate_sized(addr: usize, size: usize, align: usize) {
    if addr == 0 {
        return;
    }
    let g = globals();
    AllocatorMetrics::tick(&global_metrics().frees);

    if config::protection_enabled() && !validate_and_poison(g, addr) {
        return;
    }

    let class = g.pagemap.size_class(page_containing(addr));
    if class == 0 {
        // Sampled or large memory: the asserted size does not help.
        free_pages(g, addr);
        return;
    }

    let access = if g.sizemap.is_expanded(class) {
        AccessHint::Cold
    } else {
        AccessHint::Hot
    };
    if let Some(expected) = g.sizemap.size_class(padded(size), align.max(1), access) {
        debug_assert_eq!(
            g.sizemap.class_to_size(expected),
            g.sizemap.class_to_size(class),
            "sized free with mismatched size"
        );
    }
    free_small(g, addr, class);
}

fn free_small(g: &'static Globals, addr: usize, class: u32) {
    let pushed = with_thread_cache(|tc| {
        tc.deallocate(
            &g.sizemap,
            &g.pagemap,
            &g.page_heap,
            &g.transfer_cache,
            class,
            addr,
        );
    });
    if pushed.is_none() {
        // Thread-local storage already torn down; free into the central
        // list directly.
        g.transfer_cache
            .insert_range(&g.pagemap, &g.page_heap, class, vec![addr]);
    }
}

/// Frees an object without a size class: large, sampled, or guarded.
fn free_pages(g: &'static Globals, addr: usize) {
    let page = page_containing(addr);
    let Some(span) = g.pagemap.descriptor(page) else {
        report_violation(SafetyViolation::UnknownFree { addr });
        return;
    };
    span.prefetch();
    if span.state() == SpanState::OnFreeList {
        report_violation(SafetyViolation::InvalidFree { addr });
        return;
    }

    if let Some(sa) = span.unsample() {
        g.recorder.unregister(sa.id);
        if let Some(proxy) = sa.proxy {
            let proxy_class = g.pagemap.size_class(page_containing(proxy));
            if proxy_class != 0 {
                free_small(g, proxy, proxy_class);
            }
        }
    }

    if span.kind() == SpanKind::Guarded {
        {
            let _heap = g.page_heap.lock();
            g.pagemap.clear_range(&span);
        }
        span.destroy_escape();
        // Clearing the page map first means no new escape can target the
        // slot while its page goes PROT_NONE.
        g.guarded.deallocate(addr);
        return;
    }

    g.page_heap.lock().delete(&g.pagemap, span);
}

/// Instrumented free-path validation: drains the caller's pending escape
/// records, rejects invalid and double frees, and poisons every recorded
/// location still pointing into the freed chunk.
///
/// Returns false when the free must be skipped.
fn validate_and_poison(g: &'static Globals, addr: usize) -> bool {
    escape::flush_pending(g);

    let page = page_containing(addr);
    let Some(span) = g.pagemap.descriptor(page) else {
        if addr & escape::POISON_PATTERN == escape::POISON_PATTERN {
            report_violation(SafetyViolation::PoisonedFree { addr });
        } else {
            report_violation(SafetyViolation::UnknownFree { addr });
        }
        return false;
    };

    if span.kind() == SpanKind::Guarded {
        let Some((start, size)) = g.guarded.live_allocation(addr) else {
            report_violation(SafetyViolation::InvalidFree { addr });
            return false;
        };
        if start != addr {
            report_violation(SafetyViolation::InvalidFree { addr });
            return false;
        }
        if let Some(idx) = span.chunk_index(addr) {
            escape::poison_escapes(g, &span, idx, start, start + size);
        }
        return true;
    }

    let obj_size = span.obj_size_bytes();
    if obj_size == 0 {
        // A span parked on a free list: this chunk was already returned.
        report_violation(SafetyViolation::InvalidFree { addr });
        return false;
    }
    let start_addr = span.start_address();
    if addr < start_addr || (addr - start_addr) % obj_size != 0 {
        report_violation(SafetyViolation::InvalidFree { addr });
        return false;
    }
    let idx = (addr - start_addr) / obj_size;
    if idx >= span.objects_per_span() as usize {
        report_violation(SafetyViolation::InvalidFree { addr });
        return false;
    }
    escape::poison_escapes(g, &span, idx, addr, addr + obj_size);
    true
}

// ---------------------------------------------------------------------------
// Realloc
// ---------------------------------------------------------------------------

/// Hysteretic realloc: grows to at least `old * 1.25` on marginal growth,
/// shrinks only below `old / 2`, otherwise returns the old pointer.
/// Preserves the first `min(old, new)` bytes on a move.
#[must_use]
pub fn reallocate(addr: usize, new_size: usize) -> Option<usize> {
    if addr == 0 {
        return allocate(new_size);
    }
    if new_size == 0 {
        deallocate(addr);
        return None;
    }

    let old_size = get_size(addr);
    if old_size == 0 {
        // Unknown pointer: nothing to copy or free.
        return allocate(new_size);
    }

    let min_growth = (old_size / 4).min(usize::MAX - old_size);
    let lower_bound_to_grow = old_size + min_growth;
    let upper_bound_to_shrink = old_size / 2;

    if new_size <= old_size && new_size >= upper_bound_to_shrink {
        return Some(addr);
    }

    let mut new_addr = None;
    if new_size > old_size && new_size < lower_bound_to_grow {
        new_addr = allocate(lower_bound_to_grow);
    }
    let new_addr = match new_addr {
        Some(a) => a,
        None => allocate(new_size)?,
    };

    let copy = old_size.min(new_size);
    // SAFETY: both regions are live heap allocations of at least `copy`
    // bytes, obtained from this allocator, and cannot overlap.
    unsafe {
        std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, copy);
    }
    deallocate(addr);
    Some(new_addr)
}

/// `nallocx`: the usable size an allocation of `size` would get, without
/// allocating. `flags` encodes log2(alignment) in its low 6 bits, as in
/// the jemalloc extension.
#[must_use]
pub fn nallocx(size: usize, flags: i32) -> usize {
    if size > usize::MAX - PAGE_SIZE {
        return 0;
    }
    let g = globals();
    let align = if flags != 0 {
        1usize << (flags & 0x3f)
    } else {
        8
    };
    match g.sizemap.size_class(padded(size), align, AccessHint::Hot) {
        Some(class) => g.sizemap.class_to_size(class),
        None => pages_for(size).max(1) * PAGE_SIZE,
    }
}

// ---------------------------------------------------------------------------
// Chunk resolution and boundary checks
// ---------------------------------------------------------------------------

/// Resolves the chunk `[start, end)` containing `addr` from the packed
/// page-map entry (one load for size-class memory), falling back to the
/// span descriptor for large and sampled memory.
fn resolve_chunk(g: &Globals, addr: usize) -> Option<(usize, usize)> {
    let entry = g.pagemap.lookup(page_containing(addr));
    let class = packed_class(entry);
    let (start_addr, obj_size) = if class != 0 {
        (
            page_start(packed_first_page(entry)),
            g.sizemap.class_to_size(class),
        )
    } else {
        let span = g.pagemap.descriptor(page_containing(addr))?;
        let obj_size = span.obj_size_bytes();
        if obj_size == 0 {
            return None;
        }
        (span.start_address(), obj_size)
    };
    if addr < start_addr || obj_size == 0 {
        return None;
    }
    let chunk_start = start_addr + ((addr - start_addr) / obj_size) * obj_size;
    Some((chunk_start, chunk_start + obj_size))
}

/// `get_chunk_range(base)`: the chunk bounds for `base`, or
/// `(0, NON_HEAP_SENTINEL)` for non-heap memory.
#[must_use]
pub fn get_chunk_range(addr: usize) -> (usize, usize) {
    let g = globals();
    AllocatorMetrics::tick(&global_metrics().chunk_range_queries);
    match resolve_chunk(g, addr) {
        Some(range) => range,
        None => (0, NON_HEAP_SENTINEL),
    }
}

/// Chunk start for `base`; 0 when non-heap.
#[must_use]
pub fn get_chunk_start(addr: usize) -> usize {
    get_chunk_range(addr).0
}

/// Chunk end for `base`; `NON_HEAP_SENTINEL` when non-heap.
#[must_use]
pub fn get_chunk_end(addr: usize) -> usize {
    get_chunk_range(addr).1
}

fn check_boundary(g: &Globals, base: usize, ptr: usize, size: usize) -> i32 {
    if !config::protection_enabled() {
        return 0;
    }
    let Some((chunk_start, chunk_end)) = resolve_chunk(g, base) else {
        return 1;
    };
    if ptr >= chunk_start && ptr.saturating_add(size) <= chunk_end {
        return 0;
    }
    report_violation(SafetyViolation::OutOfBounds {
        base,
        addr: ptr,
        size,
    });
    -1
}

/// Spatial check for a derived pointer: requires
/// `[ptr, ptr + size) ⊆ [chunk_start(base), chunk_end(base))`.
///
/// Returns 0 for a valid access, -1 for a violation, 1 for non-heap
/// memory.
#[must_use]
pub fn gep_check_boundary(base: usize, ptr: usize, size: usize) -> i32 {
    AllocatorMetrics::tick(&global_metrics().gep_checks);
    check_boundary(globals(), base, ptr, size)
}

/// Spatial check with `ptr == base`.
#[must_use]
pub fn bc_check_boundary(base: usize, size: usize) -> i32 {
    AllocatorMetrics::tick(&global_metrics().bc_checks);
    check_boundary(globals(), base, base, size)
}

// ---------------------------------------------------------------------------
// Escape entry points
// ---------------------------------------------------------------------------

/// Records a pointer store; see the escape protocol.
pub fn escape(loc: usize, ptr: usize) -> i32 {
    crate::escape::escape(globals(), loc, ptr)
}

/// Drops a stale committed record after a pointer overwrite.
pub fn clear_old_escape(ptr: usize, loc: usize) {
    crate::escape::clear_old_escape(globals(), ptr, loc);
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Whether the allocator owns the pages behind `addr`.
#[must_use]
pub fn get_ownership(addr: usize) -> Ownership {
    if globals()
        .pagemap
        .descriptor(page_containing(addr))
        .is_some()
    {
        Ownership::Owned
    } else {
        Ownership::NotOwned
    }
}

/// Usable size of the allocation at `addr`; 0 for null or unknown.
#[must_use]
pub fn get_size(addr: usize) -> usize {
    if addr == 0 {
        return 0;
    }
    let g = globals();
    let page = page_containing(addr);
    let class = g.pagemap.size_class(page);
    if class != 0 {
        return g.sizemap.class_to_size(class);
    }
    let Some(span) = g.pagemap.descriptor(page) else {
        return 0;
    };
    if span.is_sampled() {
        if let Some(size) = g.guarded.requested_size(addr) {
            return size;
        }
        if let Some(sa) = span.sampled_allocation() {
            return sa.allocated_size;
        }
    }
    span.bytes_in_span()
}

/// Start addresses and byte lengths of every allocated span.
#[must_use]
pub fn get_allocated_address_ranges() -> Vec<(usize, usize)> {
    globals()
        .pagemap
        .allocated_spans()
        .iter()
        .map(|s| (s.start_address(), s.bytes_in_span()))
        .collect()
}

/// Releases at least `bytes` of physical memory to the system, minus any
/// balance over-released by earlier calls. Returns bytes released now.
pub fn release_memory_to_system(bytes: usize) -> usize {
    let g = globals();
    let mut release = g.release.lock();

    let mut want = bytes;
    if want <= release.extra_bytes_released {
        release.extra_bytes_released -= want;
        want = 0;
    } else {
        want -= release.extra_bytes_released;
    }

    let mut released = 0;
    if want > 0 {
        let pages = pages_for(want).max(1);
        released = g.page_heap.lock().release_at_least_n_pages(pages);
    }
    release.extra_bytes_released = released.saturating_sub(want);
    released
}

/// Per-CPU cache reclaim hook; the per-thread build has nothing to drop.
#[must_use]
pub fn release_cpu_memory(_cpu: usize) -> usize {
    0
}

/// Flushes the calling thread's caches back to the shared pools.
pub fn mark_thread_idle() {
    let g = globals();
    escape::flush_pending(g);
    let _ = with_thread_cache(|tc| {
        tc.flush_all(&g.pagemap, &g.page_heap, &g.transfer_cache);
    });
}

/// Current `(limit, hard)` pair.
#[must_use]
pub fn memory_limit() -> (usize, bool) {
    globals().page_heap.lock().limit()
}

/// Installs a soft or hard memory cap.
pub fn set_memory_limit(bytes: usize, hard: bool) {
    globals().page_heap.lock().set_limit(bytes, hard);
}

/// Named numeric properties consumed by external stats tooling.
#[must_use]
pub fn get_numeric_property(name: &str) -> Option<u64> {
    let g = globals();
    match name {
        "heap_size" => Some(g.page_heap.lock().heap_bytes() as u64),
        "pageheap_free_bytes" => Some(g.page_heap.lock().free_bytes() as u64),
        "sampled_allocations" => Some(g.recorder.len() as u64),
        "sample_interval" => Some(config::sample_interval()),
        "guarded_interval" => Some(config::guarded_interval()),
        _ => None,
    }
}
