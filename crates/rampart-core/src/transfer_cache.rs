//! Central free lists: the per-size-class shared pool between thread
//! caches and the page allocator.
//!
//! One lock per class, never across classes. `remove_range` refills from a
//! freshly carved span when the pool runs dry; `insert_range` hands a span
//! back to the page allocator once every one of its chunks is free.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::page_allocator::PageHeap;
use crate::pagemap::{packed_first_page, PageMap};
use crate::pages::page_containing;
use crate::size_map::{SizeMap, NUM_CLASSES};
use crate::span::SpanKind;

struct CentralFreeList {
    /// Free-object addresses, all classes' spans mixed, LIFO.
    objects: Vec<usize>,
    /// Per-span free-chunk counts, keyed by span first page.
    span_free: HashMap<usize, u32>,
}

impl CentralFreeList {
    fn new() -> Self {
        Self {
            objects: Vec::new(),
            span_free: HashMap::new(),
        }
    }
}

/// Per-size-class shared pools, one spin lock per class.
pub struct TransferCache {
    classes: Vec<Mutex<CentralFreeList>>,
}

impl TransferCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classes: (0..=NUM_CLASSES)
                .map(|_| Mutex::new(CentralFreeList::new()))
                .collect(),
        }
    }

    /// Pops up to `batch` objects of `class`, carving a fresh span from the
    /// page allocator when the pool is empty. Returns fewer (possibly zero)
    /// objects under memory pressure.
    pub fn remove_range(
        &self,
        sizemap: &SizeMap,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        class: u32,
        batch: usize,
    ) -> Vec<usize> {
        let mut list = self.classes[class as usize].lock();

        if list.objects.len() < batch {
            self.grow(&mut list, sizemap, pagemap, page_heap, class);
        }

        let take = batch.min(list.objects.len());
        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            let addr = match list.objects.pop() {
                Some(a) => a,
                None => break,
            };
            let first = packed_first_page(pagemap.lookup(page_containing(addr)));
            if let Some(free) = list.span_free.get_mut(&first) {
                *free -= 1;
            }
            if let Some(span) = pagemap.descriptor(page_containing(addr)) {
                span.add_allocated(1);
            }
            out.push(addr);
        }
        out
    }

    /// Pushes freed objects of `class`; a span that becomes entirely free
    /// is handed back to the page allocator.
    pub fn insert_range(
        &self,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        class: u32,
        objects: Vec<usize>,
    ) {
        if objects.is_empty() {
            return;
        }
        let mut list = self.classes[class as usize].lock();
        let mut touched: Vec<usize> = Vec::new();

        for addr in objects {
            let first = packed_first_page(pagemap.lookup(page_containing(addr)));
            if first == 0 {
                // The span vanished underneath us; drop the object rather
                // than corrupt the pool.
                continue;
            }
            list.objects.push(addr);
            *list.span_free.entry(first).or_insert(0) += 1;
            if let Some(span) = pagemap.descriptor(page_containing(addr)) {
                span.sub_allocated(1);
            }
            if !touched.contains(&first) {
                touched.push(first);
            }
        }

        for first in touched {
            let Some(span) = pagemap.descriptor(first) else {
                continue;
            };
            let full = span.objects_per_span();
            if full == 0 || list.span_free.get(&first) != Some(&full) {
                continue;
            }
            // Entirely free: pull its objects out of the pool and return
            // the span whole.
            let lo = span.start_address();
            let hi = lo + span.bytes_in_span();
            list.objects.retain(|&a| a < lo || a >= hi);
            list.span_free.remove(&first);
            page_heap.lock().delete(pagemap, span);
        }
    }

    /// Free objects currently pooled for `class`.
    #[must_use]
    pub fn free_objects(&self, class: u32) -> usize {
        self.classes[class as usize].lock().objects.len()
    }

    fn grow(
        &self,
        list: &mut CentralFreeList,
        sizemap: &SizeMap,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        class: u32,
    ) {
        let pages = sizemap.class_to_pages(class);
        if pages == 0 {
            return;
        }
        let Some(span) =
            page_heap
                .lock()
                .new_aligned(pagemap, pages, 1, sizemap.class_tag(class))
        else {
            return;
        };

        let obj_size = sizemap.class_to_size(class);
        let count = sizemap.objects_per_span(class);
        span.set_kind(SpanKind::SmallClass);
        span.set_layout(obj_size, count as u32);
        pagemap.set_range(&span, class);

        let start = span.start_address();
        // Push in reverse so the pool pops chunk 0 first.
        for i in (0..count).rev() {
            list.objects.push(start + i * obj_size);
        }
        list.span_free.insert(span.first_page(), count as u32);
    }
}

impl Default for TransferCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::MemoryTag;
    use crate::region::SystemRegionFactory;
    use crate::size_map::AccessHint;
    use crate::span::SpanState;
    use std::sync::Arc;

    struct Fixture {
        sizemap: SizeMap,
        pagemap: PageMap,
        page_heap: Mutex<PageHeap>,
        cache: TransferCache,
    }

    fn fixture() -> Fixture {
        Fixture {
            sizemap: SizeMap::new(),
            pagemap: PageMap::new(),
            page_heap: Mutex::new(PageHeap::new(Arc::new(SystemRegionFactory::new()))),
            cache: TransferCache::new(),
        }
    }

    #[test]
    fn remove_range_carves_and_registers_a_span() {
        let f = fixture();
        let class = f.sizemap.size_class(80, 8, AccessHint::Hot).expect("class");
        let objs = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, 4);
        assert_eq!(objs.len(), 4);

        let span = f
            .pagemap
            .descriptor(page_containing(objs[0]))
            .expect("span registered");
        assert_eq!(span.kind(), SpanKind::SmallClass);
        assert_eq!(span.obj_size_bytes(), f.sizemap.class_to_size(class));
        assert_eq!(span.allocated(), 4);
        assert_eq!(f.pagemap.size_class(page_containing(objs[0])), class);

        // Objects come out in address order, chunk 0 first.
        assert_eq!(objs[0], span.start_address());
        assert_eq!(objs[1], span.start_address() + span.obj_size_bytes());
    }

    #[test]
    fn insert_range_recycles_objects() {
        let f = fixture();
        let class = f.sizemap.size_class(64, 8, AccessHint::Hot).expect("class");
        let objs = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, 2);
        f.cache
            .insert_range(&f.pagemap, &f.page_heap, class, vec![objs[0]]);
        let again = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, 1);
        assert_eq!(again, vec![objs[0]]);
    }

    #[test]
    fn fully_free_span_returns_to_page_heap() {
        let f = fixture();
        let class = f.sizemap.size_class(512, 8, AccessHint::Hot).expect("class");
        let count = f.sizemap.objects_per_span(class);
        let objs = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, count);
        assert_eq!(objs.len(), count);
        let first_page = page_containing(objs[0]);
        assert!(f.pagemap.descriptor(first_page).is_some());

        f.cache
            .insert_range(&f.pagemap, &f.page_heap, class, objs.clone());

        // The span went back whole: its pages are a free span now and the
        // pool kept none of its objects.
        assert_eq!(f.cache.free_objects(class), 0);
        let desc = f.pagemap.descriptor(first_page).expect("free span");
        assert_eq!(desc.state(), SpanState::OnFreeList);
        assert_eq!(desc.obj_size_bytes(), 0);
        assert_eq!(f.pagemap.size_class(first_page), 0);
    }

    #[test]
    fn partial_free_keeps_the_span() {
        let f = fixture();
        let class = f.sizemap.size_class(256, 8, AccessHint::Hot).expect("class");
        let objs = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, 3);
        f.cache.insert_range(
            &f.pagemap,
            &f.page_heap,
            class,
            objs[..2].to_vec(),
        );
        let span = f
            .pagemap
            .descriptor(page_containing(objs[2]))
            .expect("span survives");
        assert_eq!(span.kind(), SpanKind::SmallClass);
        assert_eq!(span.allocated(), 1);
        // Everything the grow carved is pooled except the one live object.
        assert_eq!(
            f.cache.free_objects(class),
            f.sizemap.objects_per_span(class) - 1
        );
    }

    #[test]
    fn cold_classes_carve_cold_spans() {
        let f = fixture();
        let class = f
            .sizemap
            .size_class(128, 8, AccessHint::Cold)
            .expect("cold class");
        let objs = f
            .cache
            .remove_range(&f.sizemap, &f.pagemap, &f.page_heap, class, 1);
        let span = f
            .pagemap
            .descriptor(page_containing(objs[0]))
            .expect("span");
        assert_eq!(span.tag(), MemoryTag::Cold);
    }
}
