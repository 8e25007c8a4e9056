//! Guarded page allocator: page-isolated slots for sampled allocations.
//!
//! A small pool where every data page is flanked by `PROT_NONE` guard
//! pages. Objects are placed against the trailing guard (aligned down as
//! requested), so the first access past `ptr + size` faults. Slots are
//! protected `PROT_NONE` while free, catching late use-after-free through
//! the sampled pointer itself.

#![allow(unsafe_code)]

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::pages::PAGE_SIZE;

/// Slots in the pool; one sampled allocation each.
pub const GUARDED_SLOTS: usize = 64;

struct SlotInfo {
    addr: usize,
    size: usize,
}

struct Pool {
    base: usize,
    free: Vec<usize>,
    live: HashMap<usize, SlotInfo>,
}

/// Bounded pool of guarded single-page slots.
pub struct GuardedPageAllocator {
    pool: Mutex<Option<Pool>>,
}

impl GuardedPageAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(None),
        }
    }

    /// Takes a slot and places `size` bytes against its trailing guard,
    /// aligned down to `align`. Returns `None` when the pool is exhausted,
    /// the size exceeds one page, or the mapping failed.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        if size == 0 || size > PAGE_SIZE {
            return None;
        }
        let align = align.max(1);
        if !align.is_power_of_two() || align > PAGE_SIZE {
            return None;
        }

        let mut guard = self.pool.lock();
        if guard.is_none() {
            *guard = Some(Self::map_pool()?);
        }
        let pool = guard.as_mut().expect("pool installed above");

        let slot = pool.free.pop()?;
        let page = pool.base + (2 * slot + 1) * PAGE_SIZE;
        // SAFETY: `page` is a page of our PROT_NONE pool mapping; making it
        // readable and writable hands it out as the slot's data page.
        let rc = unsafe {
            libc::mprotect(
                page as *mut libc::c_void,
                PAGE_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            pool.free.push(slot);
            return None;
        }

        let addr = page + ((PAGE_SIZE - size) & !(align - 1));
        pool.live.insert(slot, SlotInfo { addr, size });
        Some(addr)
    }

    /// Returns a slot to the pool, re-protecting its data page so stale
    /// pointers fault until the slot is reused.
    ///
    /// Returns false when `addr` is not a live guarded allocation.
    pub fn deallocate(&self, addr: usize) -> bool {
        let mut guard = self.pool.lock();
        let Some(pool) = guard.as_mut() else {
            return false;
        };
        let Some(slot) = Self::slot_of(pool, addr) else {
            return false;
        };
        if pool.live.remove(&slot).is_none() {
            return false;
        }
        let page = pool.base + (2 * slot + 1) * PAGE_SIZE;
        // SAFETY: the slot's data page belongs to the pool mapping;
        // revoking access keeps the address reserved but faulting.
        unsafe {
            libc::mprotect(page as *mut libc::c_void, PAGE_SIZE, libc::PROT_NONE);
        }
        pool.free.push(slot);
        true
    }

    /// Whether `addr` falls inside the pool mapping.
    #[must_use]
    pub fn pointer_is_mine(&self, addr: usize) -> bool {
        let guard = self.pool.lock();
        match guard.as_ref() {
            Some(pool) => {
                addr >= pool.base && addr < pool.base + (2 * GUARDED_SLOTS + 1) * PAGE_SIZE
            }
            None => false,
        }
    }

    /// Requested size of the live allocation owning `addr`.
    #[must_use]
    pub fn requested_size(&self, addr: usize) -> Option<usize> {
        self.live_allocation(addr).map(|(_, size)| size)
    }

    /// `(start, size)` of the live allocation containing `addr`.
    #[must_use]
    pub fn live_allocation(&self, addr: usize) -> Option<(usize, usize)> {
        let guard = self.pool.lock();
        let pool = guard.as_ref()?;
        let slot = Self::slot_of(pool, addr)?;
        let info = pool.live.get(&slot)?;
        (addr >= info.addr && addr < info.addr + info.size).then_some((info.addr, info.size))
    }

    fn slot_of(pool: &Pool, addr: usize) -> Option<usize> {
        if addr < pool.base {
            return None;
        }
        let page_index = (addr - pool.base) / PAGE_SIZE;
        if page_index % 2 == 0 {
            return None; // guard page
        }
        let slot = (page_index - 1) / 2;
        (slot < GUARDED_SLOTS).then_some(slot)
    }

    fn map_pool() -> Option<Pool> {
        let bytes = (2 * GUARDED_SLOTS + 1) * PAGE_SIZE + PAGE_SIZE;
        // SAFETY: fresh anonymous PROT_NONE reservation; nothing is
        // readable until a slot is handed out.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return None;
        }
        let base = (raw as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        Some(Pool {
            base,
            free: (0..GUARDED_SLOTS).collect(),
            live: HashMap::new(),
        })
    }
}

impl Default for GuardedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}
