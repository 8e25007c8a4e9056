//! Span descriptors: metadata for a contiguous run of pages.
//!
//! A span is exactly one of small-class (carved into equal chunks), large
//! (one object), sampled, or guarded. Immutable geometry (`first_page`,
//! `num_pages`, tag) is plain data; chunk layout and allocation counts are
//! atomics readable without a lock once the span is visible through the
//! page map; the escape list and sampling attachment sit behind their own
//! mutexes. Addresses are `usize` throughout.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::pages::{page_start, MemoryTag, PAGE_SIZE};
use crate::size_map::AccessHint;

/// Slots in the chunk-indexed escape table. Chunk indexes at or above this
/// bound are never committed.
pub const ESCAPE_TABLE_SLOTS: usize = 1024;

/// What a span is dedicated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Carved into `objects_per_span` equal chunks of one size class.
    SmallClass,
    /// One large object spanning the whole run.
    Large,
    /// One sampled object with an attached `SampledAllocation`.
    Sampled,
    /// One sampled object living in a guarded-page slot.
    Guarded,
}

/// Whether the span is handed out or parked on a page-allocator free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    Allocated,
    OnFreeList,
}

/// Metadata captured when an allocation is promoted to a sampled one.
pub struct SampledAllocation {
    /// Monotonic registration id.
    pub id: u64,
    /// Call stack at allocation time.
    pub stack: Backtrace,
    /// Bytes the caller asked for.
    pub requested_size: usize,
    /// Bytes actually allocated (class size, or span bytes for page
    /// allocations).
    pub allocated_size: usize,
    /// Requested alignment; 0 when the small-size table alignment was used.
    pub requested_alignment: usize,
    /// Access hint in effect.
    pub access: AccessHint,
    /// Sampling weight for rate de-biasing.
    pub weight: usize,
    /// Wall-clock allocation time.
    pub allocation_time: SystemTime,
    /// Original small-class object kept live under this sample, pinning its
    /// span so neighboring chunks stay observable for fragmentation.
    pub proxy: Option<usize>,
    /// Start address of the sampled span.
    pub span_start: usize,
}

/// Per-chunk escape-list storage.
///
/// Spans with at most two chunks use the compact pair; everything else gets
/// the 1024-slot indirection table indexed by chunk index.
enum EscapeSlots {
    Compact([Vec<usize>; 2]),
    Table(Box<[Vec<usize>]>),
}

impl EscapeSlots {
    fn new(objects_per_span: u32) -> Self {
        if objects_per_span <= 2 {
            Self::Compact([Vec::new(), Vec::new()])
        } else {
            Self::Table(vec![Vec::new(); ESCAPE_TABLE_SLOTS].into_boxed_slice())
        }
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut Vec<usize>> {
        match self {
            Self::Compact(slots) => slots.get_mut(idx),
            Self::Table(slots) => slots.get_mut(idx),
        }
    }
}

const KIND_SMALL: u8 = 0;
const KIND_LARGE: u8 = 1;
const KIND_SAMPLED: u8 = 2;
const KIND_GUARDED: u8 = 3;

const STATE_ALLOCATED: u8 = 0;
const STATE_FREE: u8 = 1;

/// Descriptor for a contiguous run of pages.
pub struct Span {
    first_page: usize,
    num_pages: usize,
    tag: MemoryTag,
    kind: AtomicU8,
    state: AtomicU8,
    /// Chunk size in 8-byte units; 0 means "no live layout" (span parked on
    /// a free list).
    obj_size_units: AtomicU64,
    objects_per_span: AtomicU32,
    /// Chunks currently out of the central list (live or thread-cached).
    allocated: AtomicU32,
    sampled: Mutex<Option<Arc<SampledAllocation>>>,
    escapes: Mutex<Option<EscapeSlots>>,
}

impl Span {
    #[must_use]
    pub fn new(first_page: usize, num_pages: usize, kind: SpanKind, tag: MemoryTag) -> Self {
        Self {
            first_page,
            num_pages,
            tag,
            kind: AtomicU8::new(kind_to_u8(kind)),
            state: AtomicU8::new(STATE_ALLOCATED),
            obj_size_units: AtomicU64::new(0),
            objects_per_span: AtomicU32::new(0),
            allocated: AtomicU32::new(0),
            sampled: Mutex::new(None),
            escapes: Mutex::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub fn first_page(&self) -> usize {
        self.first_page
    }

    #[inline]
    #[must_use]
    pub fn last_page(&self) -> usize {
        self.first_page + self.num_pages - 1
    }

    #[inline]
    #[must_use]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[inline]
    #[must_use]
    pub fn start_address(&self) -> usize {
        page_start(self.first_page)
    }

    #[inline]
    #[must_use]
    pub fn bytes_in_span(&self) -> usize {
        self.num_pages * PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub fn tag(&self) -> MemoryTag {
        self.tag
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> SpanKind {
        kind_from_u8(self.kind.load(Ordering::Acquire))
    }

    pub fn set_kind(&self, kind: SpanKind) {
        self.kind.store(kind_to_u8(kind), Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SpanState {
        if self.state.load(Ordering::Acquire) == STATE_FREE {
            SpanState::OnFreeList
        } else {
            SpanState::Allocated
        }
    }

    pub fn set_state(&self, state: SpanState) {
        let raw = match state {
            SpanState::Allocated => STATE_ALLOCATED,
            SpanState::OnFreeList => STATE_FREE,
        };
        self.state.store(raw, Ordering::Release);
    }

    /// Chunk size in bytes; 0 while the span has no live layout.
    #[inline]
    #[must_use]
    pub fn obj_size_bytes(&self) -> usize {
        (self.obj_size_units.load(Ordering::Acquire) as usize) * 8
    }

    #[inline]
    #[must_use]
    pub fn objects_per_span(&self) -> u32 {
        self.objects_per_span.load(Ordering::Acquire)
    }

    /// Installs the chunk layout. `obj_size` must be a multiple of 8.
    pub fn set_layout(&self, obj_size: usize, objects_per_span: u32) {
        self.obj_size_units
            .store((obj_size / 8) as u64, Ordering::Release);
        self.objects_per_span
            .store(objects_per_span, Ordering::Release);
    }

    /// Clears the layout when the span is parked on a free list.
    pub fn clear_layout(&self) {
        self.obj_size_units.store(0, Ordering::Release);
        self.objects_per_span.store(0, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn add_allocated(&self, n: u32) {
        self.allocated.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_allocated(&self, n: u32) {
        self.allocated.fetch_sub(n, Ordering::AcqRel);
    }

    /// Chunk index of `addr`, when the span has a layout and `addr` falls
    /// inside a valid chunk.
    #[must_use]
    pub fn chunk_index(&self, addr: usize) -> Option<usize> {
        let obj_size = self.obj_size_bytes();
        if obj_size == 0 || addr < self.start_address() {
            return None;
        }
        let idx = (addr - self.start_address()) / obj_size;
        (idx < self.objects_per_span() as usize).then_some(idx)
    }

    /// `[chunk_start, chunk_end)` of the chunk containing `addr`.
    #[must_use]
    pub fn chunk_range(&self, addr: usize) -> Option<(usize, usize)> {
        let obj_size = self.obj_size_bytes();
        if obj_size == 0 || addr < self.start_address() {
            return None;
        }
        let start = self.start_address() + ((addr - self.start_address()) / obj_size) * obj_size;
        Some((start, start + obj_size))
    }

    /// Fraction of span bytes wasted by in-span free chunks; used only for
    /// the fragmentation profile.
    #[must_use]
    pub fn fragmentation(&self, obj_size: usize) -> f64 {
        let objects = self.objects_per_span() as usize;
        if objects == 0 {
            return 0.0;
        }
        let free = objects.saturating_sub(self.allocated() as usize);
        (obj_size * free) as f64 / self.bytes_in_span() as f64
    }

    /// Touches the descriptor's hot word ahead of lock acquisition.
    #[inline]
    pub fn prefetch(&self) {
        let _ = self.obj_size_units.load(Ordering::Relaxed);
    }

    /// Attaches a sampled allocation to this span.
    pub fn sample(&self, sa: Arc<SampledAllocation>) {
        *self.sampled.lock() = Some(sa);
    }

    /// Detaches and returns the sampled allocation, if any. The attachment
    /// is cleared exactly once; concurrent callers race for the `Some`.
    #[must_use]
    pub fn unsample(&self) -> Option<Arc<SampledAllocation>> {
        self.sampled.lock().take()
    }

    /// Reads the current sampled allocation without detaching it.
    #[must_use]
    pub fn sampled_allocation(&self) -> Option<Arc<SampledAllocation>> {
        self.sampled.lock().clone()
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.sampled.lock().is_some()
    }

    /// Appends `loc` to the chunk's escape list, creating the list storage
    /// on first use. Returns false when `idx` is outside the table.
    pub fn record_escape(&self, idx: usize, loc: usize) -> bool {
        if idx >= ESCAPE_TABLE_SLOTS {
            return false;
        }
        let mut guard = self.escapes.lock();
        let slots = guard
            .get_or_insert_with(|| EscapeSlots::new(self.objects_per_span()));
        match slots.slot_mut(idx) {
            Some(slot) => {
                slot.push(loc);
                true
            }
            None => false,
        }
    }

    /// Drops the record for `loc` in chunk `idx`, if present.
    pub fn remove_escape(&self, idx: usize, loc: usize) {
        let mut guard = self.escapes.lock();
        if let Some(slots) = guard.as_mut() {
            if let Some(slot) = slots.slot_mut(idx) {
                if let Some(pos) = slot.iter().position(|&l| l == loc) {
                    slot.swap_remove(pos);
                }
            }
        }
    }

    /// Takes every recorded location for chunk `idx`, releasing the records.
    #[must_use]
    pub fn take_escape_slot(&self, idx: usize) -> Vec<usize> {
        let mut guard = self.escapes.lock();
        match guard.as_mut().and_then(|slots| slots.slot_mut(idx)) {
            Some(slot) => std::mem::take(slot),
            None => Vec::new(),
        }
    }

    /// Walks and releases the whole escape list plus its container.
    pub fn destroy_escape(&self) {
        *self.escapes.lock() = None;
    }

    /// Whether any chunk of this span has recorded escapes.
    #[must_use]
    pub fn has_escapes(&self) -> bool {
        let guard = self.escapes.lock();
        match guard.as_ref() {
            None => false,
            Some(EscapeSlots::Compact(slots)) => slots.iter().any(|s| !s.is_empty()),
            Some(EscapeSlots::Table(slots)) => slots.iter().any(|s| !s.is_empty()),
        }
    }
}

fn kind_to_u8(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::SmallClass => KIND_SMALL,
        SpanKind::Large => KIND_LARGE,
        SpanKind::Sampled => KIND_SAMPLED,
        SpanKind::Guarded => KIND_GUARDED,
    }
}

fn kind_from_u8(raw: u8) -> SpanKind {
    match raw {
        KIND_LARGE => SpanKind::Large,
        KIND_SAMPLED => SpanKind::Sampled,
        KIND_GUARDED => SpanKind::Guarded,
        _ => SpanKind::SmallClass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_with_layout() -> Span {
        let span = Span::new(100, 1, SpanKind::SmallClass, MemoryTag::Normal);
        span.set_layout(80, (PAGE_SIZE / 80) as u32);
        span
    }

    #[test]
    fn geometry() {
        let span = Span::new(100, 3, SpanKind::Large, MemoryTag::Normal);
        assert_eq!(span.start_address(), 100 * PAGE_SIZE);
        assert_eq!(span.bytes_in_span(), 3 * PAGE_SIZE);
        assert_eq!(span.last_page(), 102);
    }

    #[test]
    fn chunk_math() {
        let span = span_with_layout();
        let base = span.start_address();
        assert_eq!(span.chunk_index(base), Some(0));
        assert_eq!(span.chunk_index(base + 80), Some(1));
        assert_eq!(span.chunk_index(base + 85), Some(1));
        assert_eq!(span.chunk_range(base + 85), Some((base + 80, base + 160)));
        // Past the last full chunk.
        assert_eq!(span.chunk_index(base + PAGE_SIZE - 1), None);
    }

    #[test]
    fn layout_clears_to_zero() {
        let span = span_with_layout();
        assert_eq!(span.obj_size_bytes(), 80);
        span.clear_layout();
        assert_eq!(span.obj_size_bytes(), 0);
        assert_eq!(span.chunk_index(span.start_address()), None);
    }

    #[test]
    fn fragmentation_counts_free_chunks() {
        let span = span_with_layout();
        let objects = span.objects_per_span() as usize;
        span.add_allocated(objects as u32);
        assert_eq!(span.fragmentation(80), 0.0);
        span.sub_allocated(1);
        let expected = 80.0 / span.bytes_in_span() as f64;
        assert!((span.fragmentation(80) - expected).abs() < 1e-12);
    }

    #[test]
    fn escape_slots_compact_and_table() {
        let single = Span::new(1, 1, SpanKind::Large, MemoryTag::Normal);
        single.set_layout(PAGE_SIZE, 1);
        assert!(single.record_escape(0, 0x1000));
        assert!(!single.record_escape(5, 0x1000));
        assert_eq!(single.take_escape_slot(0), vec![0x1000]);
        assert_eq!(single.take_escape_slot(0), Vec::<usize>::new());

        let many = span_with_layout();
        assert!(many.record_escape(3, 0x2000));
        assert!(many.record_escape(3, 0x3000));
        many.remove_escape(3, 0x2000);
        assert_eq!(many.take_escape_slot(3), vec![0x3000]);
        assert!(!many.record_escape(ESCAPE_TABLE_SLOTS, 0x4000));
    }

    #[test]
    fn destroy_escape_releases_everything() {
        let span = span_with_layout();
        assert!(span.record_escape(0, 0xAAAA));
        assert!(span.has_escapes());
        span.destroy_escape();
        assert!(!span.has_escapes());
        assert_eq!(span.take_escape_slot(0), Vec::<usize>::new());
    }

    #[test]
    fn sampling_attach_detach() {
        let span = Span::new(7, 1, SpanKind::Sampled, MemoryTag::Sampled);
        let sa = Arc::new(SampledAllocation {
            id: 1,
            stack: Backtrace::disabled(),
            requested_size: 75,
            allocated_size: 80,
            requested_alignment: 0,
            access: AccessHint::Hot,
            weight: 1 << 20,
            allocation_time: SystemTime::now(),
            proxy: None,
            span_start: span.start_address(),
        });
        span.sample(Arc::clone(&sa));
        assert!(span.is_sampled());
        let got = span.unsample().expect("attached");
        assert_eq!(got.id, 1);
        assert!(span.unsample().is_none());
    }
}
