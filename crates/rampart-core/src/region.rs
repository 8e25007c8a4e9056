//! Region factory: the allocator's narrow OS page supplier.
//!
//! The core consumes only `reserve(pages, tag) -> base address` and
//! `release(addr, pages)`. The default `SystemRegionFactory` maps anonymous
//! memory and releases at span granularity with `madvise(MADV_DONTNEED)`;
//! reservations are never unmapped, so any address the allocator has ever
//! handed out stays readable for the lifetime of the process. The escape
//! machinery relies on that when it revalidates recorded locations.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::pages::{MemoryTag, PAGE_SIZE};

/// OS page supplier consumed by the page allocator.
pub trait RegionFactory: Send + Sync {
    /// Reserves `pages` contiguous pages for `tag`, returning the
    /// page-aligned base address, or `None` when the system refuses.
    fn reserve(&self, pages: usize, tag: MemoryTag) -> Option<usize>;

    /// Returns the physical memory behind `[addr, addr + pages)` to the
    /// system. The address range stays reserved and readable.
    fn release(&self, addr: usize, pages: usize);

    /// Total bytes currently reserved from the system.
    fn reserved_bytes(&self) -> usize;

    /// Tag of the reservation containing `addr`, if the factory owns it.
    fn tag_of(&self, addr: usize) -> Option<MemoryTag>;
}

struct Reservation {
    pages: usize,
    tag: MemoryTag,
}

/// Default region factory backed by anonymous `mmap`.
pub struct SystemRegionFactory {
    /// Reservations keyed by aligned base address.
    regions: RwLock<BTreeMap<usize, Reservation>>,
    reserved: AtomicUsize,
}

impl SystemRegionFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: RwLock::new(BTreeMap::new()),
            reserved: AtomicUsize::new(0),
        }
    }
}

impl Default for SystemRegionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionFactory for SystemRegionFactory {
    fn reserve(&self, pages: usize, tag: MemoryTag) -> Option<usize> {
        if pages == 0 {
            return None;
        }
        let bytes = pages.checked_mul(PAGE_SIZE)?;
        // Over-allocate one page so the base can be aligned to the
        // allocator page size; mmap only guarantees OS-page alignment.
        let mapped = bytes.checked_add(PAGE_SIZE)?;

        // SAFETY: anonymous private mapping with no fixed address; the
        // returned range is exclusively ours until released.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }

        let base = (raw as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        self.regions
            .write()
            .insert(base, Reservation { pages, tag });
        self.reserved.fetch_add(bytes, Ordering::Relaxed);
        Some(base)
    }

    fn release(&self, addr: usize, pages: usize) {
        if pages == 0 {
            return;
        }
        // SAFETY: the range is an allocator-page-aligned sub-range of a
        // live reservation; MADV_DONTNEED keeps it mapped, dropping only
        // the backing pages.
        unsafe {
            libc::madvise(addr as *mut libc::c_void, pages * PAGE_SIZE, libc::MADV_DONTNEED);
        }
    }

    fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    fn tag_of(&self, addr: usize) -> Option<MemoryTag> {
        let regions = self.regions.read();
        let (&base, r) = regions.range(..=addr).next_back()?;
        let end = base + r.pages * PAGE_SIZE;
        (addr < end).then_some(r.tag)
    }
}
