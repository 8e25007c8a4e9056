//! Page map: `PageId → (size class, span first page)` plus span descriptors.
//!
//! Each entry packs both fields into one machine word so a single load
//! resolves the size class and the chunk origin without touching cold span
//! metadata: the low byte is the size class (0 means large/sampled/none)
//! and the upper bits are the span's first page.
//!
//! Two-level structure: a read-mostly directory of 512-entry leaves whose
//! entries are atomics. Lookups take the shared directory lock and one
//! atomic load; writes are serialized by the page-heap lock. A second map
//! keyed by span first page resolves full descriptors for the cold paths
//! (large frees, sampling, coalescing).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::span::{Span, SpanState};

const LEAF_SHIFT: usize = 9;
const LEAF_PAGES: usize = 1 << LEAF_SHIFT; // 512 pages = 4 MiB per leaf
const CLASS_BITS: u64 = 8;
const CLASS_MASK: u64 = (1 << CLASS_BITS) - 1;

struct Leaf {
    entries: [std::sync::atomic::AtomicU64; LEAF_PAGES],
}

impl Leaf {
    fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| std::sync::atomic::AtomicU64::new(0)),
        }
    }
}

/// Packs `(size_class, span_first_page)` into one entry word.
#[inline]
#[must_use]
pub fn pack(size_class: u32, span_first_page: usize) -> u64 {
    ((span_first_page as u64) << CLASS_BITS) | (u64::from(size_class) & CLASS_MASK)
}

/// Size-class byte of a packed entry.
#[inline]
#[must_use]
pub fn packed_class(entry: u64) -> u32 {
    (entry & CLASS_MASK) as u32
}

/// Span-first-page bits of a packed entry.
#[inline]
#[must_use]
pub fn packed_first_page(entry: u64) -> usize {
    (entry >> CLASS_BITS) as usize
}

/// Total function from page id to packed entry and span descriptor.
pub struct PageMap {
    leaves: RwLock<HashMap<usize, Arc<Leaf>>>,
    spans: RwLock<HashMap<usize, Arc<Span>>>,
}

impl PageMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            leaves: RwLock::new(HashMap::new()),
            spans: RwLock::new(HashMap::new()),
        }
    }

    /// Packed entry for `page`; 0 means "no span here".
    #[must_use]
    pub fn lookup(&self, page: usize) -> u64 {
        let leaves = self.leaves.read();
        match leaves.get(&(page >> LEAF_SHIFT)) {
            Some(leaf) => leaf.entries[page & (LEAF_PAGES - 1)]
                .load(std::sync::atomic::Ordering::Acquire),
            None => 0,
        }
    }

    /// Size class for `page`; 0 for large/sampled spans and unmapped pages.
    #[inline]
    #[must_use]
    pub fn size_class(&self, page: usize) -> u32 {
        packed_class(self.lookup(page))
    }

    /// Full descriptor for the span covering `page`.
    #[must_use]
    pub fn descriptor(&self, page: usize) -> Option<Arc<Span>> {
        let entry = self.lookup(page);
        if entry == 0 {
            return None;
        }
        self.spans.read().get(&packed_first_page(entry)).cloned()
    }

    /// Registers `span` with `size_class`, writing the packed entry for
    /// every page of the span and indexing the descriptor.
    ///
    /// Callers hold the page-heap lock; readers observe either the old or
    /// the new entry for any given page.
    pub fn set_range(&self, span: &Arc<Span>, size_class: u32) {
        let entry = pack(size_class, span.first_page());
        self.spans
            .write()
            .insert(span.first_page(), Arc::clone(span));
        for page in span.first_page()..=span.last_page() {
            self.leaf_for(page).entries[page & (LEAF_PAGES - 1)]
                .store(entry, std::sync::atomic::Ordering::Release);
        }
    }

    /// Clears the packed entries of `span` and drops its descriptor index.
    pub fn clear_range(&self, span: &Span) {
        self.spans.write().remove(&span.first_page());
        let leaves = self.leaves.read();
        for page in span.first_page()..=span.last_page() {
            if let Some(leaf) = leaves.get(&(page >> LEAF_SHIFT)) {
                leaf.entries[page & (LEAF_PAGES - 1)]
                    .store(0, std::sync::atomic::Ordering::Release);
            }
        }
    }

    /// Drops only the descriptor index entry for `span`; used while
    /// splitting and merging, where the successor's `set_range` rewrites
    /// the packed entries.
    pub fn unindex(&self, span: &Span) {
        self.spans.write().remove(&span.first_page());
    }

    /// Snapshot of allocated spans, for the address-range introspection.
    #[must_use]
    pub fn allocated_spans(&self) -> Vec<Arc<Span>> {
        self.spans
            .read()
            .values()
            .filter(|s| s.state() == SpanState::Allocated)
            .cloned()
            .collect()
    }

    fn leaf_for(&self, page: usize) -> Arc<Leaf> {
        let key = page >> LEAF_SHIFT;
        {
            let leaves = self.leaves.read();
            if let Some(leaf) = leaves.get(&key) {
                return Arc::clone(leaf);
            }
        }
        let mut leaves = self.leaves.write();
        Arc::clone(leaves.entry(key).or_insert_with(|| Arc::new(Leaf::new())))
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}
