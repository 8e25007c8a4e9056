//! Per-thread object caches.
//!
//! Each thread keeps a small LIFO magazine of free objects per size class,
//! so the allocation and free hot paths touch no lock. Underflow pulls one
//! batch from the central list; overflow flushes the oldest batch back.
//! Batches shrink as object sizes grow, bounding the memory a cache can
//! pin. Thread teardown drains every magazine back to the central pools.

use std::cell::RefCell;

use parking_lot::Mutex;

use crate::page_allocator::PageHeap;
use crate::pagemap::PageMap;
use crate::size_map::{SizeMap, NUM_CLASSES};
use crate::transfer_cache::TransferCache;

/// Objects moved between a thread cache and the central list per refill or
/// flush. Larger classes use smaller batches.
#[must_use]
pub fn batch_size(sizemap: &SizeMap, class: u32) -> usize {
    let size = sizemap.class_to_size(class);
    if size == 0 {
        return 0;
    }
    (16 * 1024 / size).clamp(2, 32)
}

struct Magazine {
    objects: Vec<usize>,
    capacity: usize,
}

impl Magazine {
    const fn new() -> Self {
        Self {
            objects: Vec::new(),
            capacity: 0,
        }
    }
}

/// Per-thread stack of free objects per size class.
pub struct ThreadCache {
    magazines: Vec<Magazine>,
}

impl ThreadCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            magazines: (0..=NUM_CLASSES).map(|_| Magazine::new()).collect(),
        }
    }

    /// Pops an object of `class`, refilling one batch from the central
    /// list on underflow. `None` means the central list could not produce
    /// memory either.
    pub fn allocate(
        &mut self,
        sizemap: &SizeMap,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        transfer: &TransferCache,
        class: u32,
    ) -> Option<usize> {
        let magazine = self.magazines.get_mut(class as usize)?;
        if let Some(addr) = magazine.objects.pop() {
            return Some(addr);
        }

        let batch = batch_size(sizemap, class);
        if magazine.capacity == 0 {
            magazine.capacity = 2 * batch;
        }
        let mut objs = transfer.remove_range(sizemap, pagemap, page_heap, class, batch);
        let out = objs.pop();
        magazine.objects.extend(objs);
        out
    }

    /// Pushes a freed object of `class`; past the class high-water mark the
    /// oldest batch flushes to the central list.
    pub fn deallocate(
        &mut self,
        sizemap: &SizeMap,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        transfer: &TransferCache,
        class: u32,
        addr: usize,
    ) {
        let Some(magazine) = self.magazines.get_mut(class as usize) else {
            return;
        };
        let batch = batch_size(sizemap, class);
        if magazine.capacity == 0 {
            magazine.capacity = 2 * batch;
        }
        magazine.objects.push(addr);
        if magazine.objects.len() > magazine.capacity {
            let spill: Vec<usize> = magazine.objects.drain(..batch).collect();
            transfer.insert_range(pagemap, page_heap, class, spill);
        }
    }

    /// Returns every cached object to the central lists.
    pub fn flush_all(
        &mut self,
        pagemap: &PageMap,
        page_heap: &Mutex<PageHeap>,
        transfer: &TransferCache,
    ) {
        for (class, magazine) in self.magazines.iter_mut().enumerate() {
            if magazine.objects.is_empty() {
                continue;
            }
            let objs = std::mem::take(&mut magazine.objects);
            transfer.insert_range(pagemap, page_heap, class as u32, objs);
        }
    }

    /// Objects currently cached across all classes.
    #[must_use]
    pub fn total_cached(&self) -> usize {
        self.magazines.iter().map(|m| m.objects.len()).sum()
    }
}

impl Default for ThreadCache {
    fn default() -> Self {
        Self::new()
    }
}

struct TlsCache(ThreadCache);

impl Drop for TlsCache {
    fn drop(&mut self) {
        // Thread teardown: return cached objects to the central pools. The
        // globals may legitimately not exist if this thread never touched
        // the allocator's slow path.
        if let Some(g) = crate::allocator::globals_if_inited() {
            self.0.flush_all(&g.pagemap, &g.page_heap, &g.transfer_cache);
        }
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<TlsCache> = RefCell::new(TlsCache(ThreadCache::new()));
}

/// Accesses the calling thread's cache.
///
/// Returns `None` when the thread-local is already being torn down.
pub fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    THREAD_CACHE
        .try_with(|cache| f(&mut cache.borrow_mut().0))
        .ok()
}
