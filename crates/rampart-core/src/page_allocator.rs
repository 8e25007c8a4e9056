//! Page allocator: obtains spans from the region factory and services
//! large allocations.
//!
//! Free spans are kept per `(tag, page count)` in an ordered map; an
//! allocation searches the smallest count that fits, splits off remainders,
//! and re-inserts them. On a miss the heap grows by a whole region-factory
//! chunk. Deletion coalesces with free neighbors discovered through the
//! page map. The whole structure lives behind the process-wide page-heap
//! lock; `release_at_least_n_pages` is additionally serialized by a
//! dedicated release lock so its system calls do not stall allocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::pages::{align_up, MemoryTag, PAGE_SIZE};
use crate::pagemap::PageMap;
use crate::region::RegionFactory;
use crate::span::{Span, SpanKind, SpanState};

/// Minimum growth unit requested from the region factory, in pages (1 MiB).
const MIN_RESERVE_PAGES: usize = 128;

/// Page-level allocator state; guarded by the page-heap lock.
pub struct PageHeap {
    factory: Arc<dyn RegionFactory>,
    /// Free spans bucketed by `(tag, page count)`.
    free_lists: BTreeMap<(MemoryTag, usize), Vec<Arc<Span>>>,
    /// Bytes obtained from the region factory.
    heap_bytes: usize,
    /// Pages currently parked on free lists.
    free_pages: usize,
    limit_bytes: usize,
    limit_hard: bool,
}

impl PageHeap {
    #[must_use]
    pub fn new(factory: Arc<dyn RegionFactory>) -> Self {
        Self {
            factory,
            free_lists: BTreeMap::new(),
            heap_bytes: 0,
            free_pages: 0,
            limit_bytes: usize::MAX,
            limit_hard: false,
        }
    }

    /// Returns a freshly owned span of `pages` pages whose start page is a
    /// multiple of `align_pages`, tagged `tag`, registered in `pagemap`
    /// with size class 0.
    pub fn new_aligned(
        &mut self,
        pagemap: &PageMap,
        pages: usize,
        align_pages: usize,
        tag: MemoryTag,
    ) -> Option<Arc<Span>> {
        debug_assert!(pages > 0);
        let align_pages = align_pages.max(1);

        if let Some(span) = self.carve(pagemap, pages, align_pages, tag) {
            return Some(span);
        }

        // Miss: grow by one region-factory chunk, then carve from it.
        let want = pages + align_pages - 1;
        let mut chunk = want.max(MIN_RESERVE_PAGES);
        if !self.within_limit(chunk) {
            chunk = want;
            if !self.within_limit(chunk) {
                return None;
            }
        }
        let base = self.factory.reserve(chunk, tag)?;
        self.heap_bytes += chunk * PAGE_SIZE;

        let fresh = Arc::new(Span::new(
            base / PAGE_SIZE,
            chunk,
            SpanKind::Large,
            tag,
        ));
        fresh.set_state(SpanState::OnFreeList);
        pagemap.set_range(&fresh, 0);
        self.push_free(fresh);

        self.carve(pagemap, pages, align_pages, tag)
    }

    /// Returns `span`'s pages to the free lists, coalescing with free
    /// neighbors found through the page map.
    pub fn delete(&mut self, pagemap: &PageMap, span: Arc<Span>) {
        span.destroy_escape();
        span.clear_layout();

        let mut first = span.first_page();
        let mut pages = span.num_pages();
        let tag = span.tag();
        pagemap.unindex(&span);

        if let Some(left) = pagemap.descriptor(first.wrapping_sub(1)) {
            if left.state() == SpanState::OnFreeList
                && left.tag() == tag
                && left.last_page() + 1 == first
            {
                self.remove_free(&left);
                pagemap.unindex(&left);
                first = left.first_page();
                pages += left.num_pages();
            }
        }
        if let Some(right) = pagemap.descriptor(first + pages) {
            if right.state() == SpanState::OnFreeList
                && right.tag() == tag
                && right.first_page() == first + pages
            {
                self.remove_free(&right);
                pagemap.unindex(&right);
                pages += right.num_pages();
            }
        }

        let merged = Arc::new(Span::new(first, pages, SpanKind::Large, tag));
        merged.set_state(SpanState::OnFreeList);
        pagemap.set_range(&merged, 0);
        self.push_free(merged);
    }

    /// Returns physical memory to the system, span by span, until at least
    /// `pages` pages worth of bytes have been released. Works largest-first
    /// and may release more than asked.
    pub fn release_at_least_n_pages(&mut self, pages: usize) -> usize {
        let want = pages * PAGE_SIZE;
        let mut released = 0usize;
        for ((_, _), spans) in self.free_lists.iter().rev() {
            for span in spans {
                self.factory
                    .release(span.start_address(), span.num_pages());
                released += span.bytes_in_span();
                if released >= want {
                    return released;
                }
            }
        }
        released
    }

    /// Current `(limit, hard)` pair.
    #[must_use]
    pub fn limit(&self) -> (usize, bool) {
        (self.limit_bytes, self.limit_hard)
    }

    /// Installs a soft or hard cap. A hard cap fails growth that would
    /// exceed it; a soft cap only affects reporting.
    pub fn set_limit(&mut self, bytes: usize, hard: bool) {
        self.limit_bytes = bytes;
        self.limit_hard = hard;
    }

    /// Bytes obtained from the region factory.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes
    }

    /// Bytes parked on free lists.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.free_pages * PAGE_SIZE
    }

    fn within_limit(&self, grow_pages: usize) -> bool {
        !self.limit_hard || self.heap_bytes + grow_pages * PAGE_SIZE <= self.limit_bytes
    }

    /// Smallest free span that can host `pages` at `align_pages`, split
    /// into (head remainder, allocation, tail remainder).
    fn carve(
        &mut self,
        pagemap: &PageMap,
        pages: usize,
        align_pages: usize,
        tag: MemoryTag,
    ) -> Option<Arc<Span>> {
        let mut found: Option<Arc<Span>> = None;
        for ((t, _count), spans) in self.free_lists.range((tag, pages)..=(tag, usize::MAX)) {
            debug_assert_eq!(*t, tag);
            if let Some(span) = spans.iter().find(|s| {
                let aligned = align_up(s.first_page(), align_pages);
                aligned + pages <= s.first_page() + s.num_pages()
            }) {
                found = Some(Arc::clone(span));
                break;
            }
        }
        let old = found?;
        self.remove_free(&old);
        pagemap.unindex(&old);

        let aligned = align_up(old.first_page(), align_pages);
        let head = aligned - old.first_page();
        let tail = old.first_page() + old.num_pages() - (aligned + pages);

        if head > 0 {
            let rem = Arc::new(Span::new(old.first_page(), head, SpanKind::Large, tag));
            rem.set_state(SpanState::OnFreeList);
            pagemap.set_range(&rem, 0);
            self.push_free(rem);
        }
        if tail > 0 {
            let rem = Arc::new(Span::new(aligned + pages, tail, SpanKind::Large, tag));
            rem.set_state(SpanState::OnFreeList);
            pagemap.set_range(&rem, 0);
            self.push_free(rem);
        }

        let kind = if tag == MemoryTag::Sampled {
            SpanKind::Sampled
        } else {
            SpanKind::Large
        };
        let span = Arc::new(Span::new(aligned, pages, kind, tag));
        pagemap.set_range(&span, 0);
        Some(span)
    }

    fn push_free(&mut self, span: Arc<Span>) {
        self.free_pages += span.num_pages();
        self.free_lists
            .entry((span.tag(), span.num_pages()))
            .or_default()
            .push(span);
    }

    fn remove_free(&mut self, span: &Arc<Span>) {
        let key = (span.tag(), span.num_pages());
        if let Some(bucket) = self.free_lists.get_mut(&key) {
            if let Some(pos) = bucket.iter().position(|s| Arc::ptr_eq(s, span)) {
                bucket.swap_remove(pos);
                self.free_pages -= span.num_pages();
            }
            if bucket.is_empty() {
                self.free_lists.remove(&key);
            }
        }
    }
}
