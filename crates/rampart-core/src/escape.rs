//! Escape tracking: which memory locations hold pointers into which chunks.
//!
//! `escape(loc, ptr)` is called by instrumented code whenever the program
//! stores a pointer `ptr` into heap location `loc` (the call precedes the
//! store, so `*loc` still holds the old value). Records funnel through a
//! per-thread write-combining buffer that collapses repeated stores to the
//! same location and amortizes page-map traversals; commits re-validate
//! `*loc == ptr` so stale entries die quietly. On free, the freed chunk's
//! records are re-validated once more and every location still pointing
//! into the chunk gets its high 32 bits stamped with the poison sentinel,
//! so dangling copies trap on dereference.
//!
//! Reading and stamping `*loc` is sound because every address the
//! allocator ever returned stays mapped (the region factory releases with
//! `madvise`, never `munmap`); the one exception is dead guarded slots,
//! which are `PROT_NONE` and checked for explicitly.

#![allow(unsafe_code)]

use std::cell::RefCell;

use crate::allocator::{globals_if_inited, Globals};
use crate::config;
use crate::metrics::{global_metrics, AllocatorMetrics};
use crate::pages::page_containing;
use crate::span::{Span, ESCAPE_TABLE_SLOTS};

/// Poison stamp: the high 32 bits of a dangling location after free.
pub const POISON_PATTERN: usize = 0xDEAD_BEEF << 32;

/// Write-combining buffer capacity per thread.
const WRITE_COMBINE_CAP: usize = 16;

struct EscapeBuffer {
    entries: Vec<(usize, usize)>,
}

impl Drop for EscapeBuffer {
    fn drop(&mut self) {
        // Thread teardown drains the buffer; records that still validate
        // are committed so later frees can poison them.
        if let Some(g) = globals_if_inited() {
            for (loc, ptr) in self.entries.drain(..) {
                commit_escape(g, loc, ptr);
            }
        }
    }
}

thread_local! {
    static BUFFER: RefCell<EscapeBuffer> = RefCell::new(EscapeBuffer {
        entries: Vec::new(),
    });
}

/// Records that the program is storing `ptr` into `loc`.
///
/// Returns 0 when handled (including the same-chunk no-op), -1 when the
/// store is uninteresting (either address outside heap-owned memory, or a
/// stale/free span). With protection compiled out this is a no-op
/// returning 0.
pub fn escape(g: &Globals, loc: usize, ptr: usize) -> i32 {
    if !config::protection_enabled() {
        return 0;
    }
    let m = global_metrics();
    AllocatorMetrics::tick(&m.escapes);

    // Non-heap stores are uninteresting; this also keeps commit-time and
    // poison-time reads of *loc inside memory we know stays mapped.
    if g.pagemap.descriptor(page_containing(loc)).is_none() {
        return -1;
    }
    AllocatorMetrics::tick(&m.escapes_heap);

    let Some(span) = g.pagemap.descriptor(page_containing(ptr)) else {
        return -1;
    };
    span.prefetch();

    // A span parked on the page-heap free list keeps its page-map entries
    // but has no layout; nothing to track.
    let obj_size = span.obj_size_bytes();
    if obj_size == 0 {
        return -1;
    }
    AllocatorMetrics::tick(&m.escapes_valid);

    let start = span.start_address();
    if ptr < start {
        return -1;
    }
    let idx = (ptr - start) / obj_size;
    let chunk_start = start + idx * obj_size;

    // The store has not happened yet; if the old value already points into
    // the same chunk the record would be redundant (initializing loops,
    // self-assignments).
    if let Some(old) = read_location(g, loc) {
        if old >= chunk_start && old < chunk_start + obj_size {
            AllocatorMetrics::tick(&m.escapes_same_chunk);
            return 0;
        }
    }

    if idx >= span.objects_per_span() as usize {
        tracing::warn!(
            "escape target {ptr:#x} is past the span's chunks (idx {idx})"
        );
        return -1;
    }

    BUFFER.with(|b| {
        let mut buf = b.borrow_mut();
        if buf.entries.len() >= WRITE_COMBINE_CAP {
            for (l, p) in buf.entries.drain(..) {
                commit_escape(g, l, p);
            }
        }
        buf.entries.push((loc, ptr));
    });
    AllocatorMetrics::tick(&m.escapes_buffered);
    0
}

/// Commits one buffered record into its span's chunk-indexed escape list.
///
/// Skips records whose location was overwritten since recording or whose
/// span has been freed.
pub(crate) fn commit_escape(g: &Globals, loc: usize, ptr: usize) {
    let m = global_metrics();
    let Some(cur) = read_location(g, loc) else {
        AllocatorMetrics::tick(&m.escapes_stale_at_commit);
        return;
    };
    if cur != ptr {
        AllocatorMetrics::tick(&m.escapes_stale_at_commit);
        return;
    }
    let Some(span) = g.pagemap.descriptor(page_containing(ptr)) else {
        AllocatorMetrics::tick(&m.escapes_stale_at_commit);
        return;
    };
    let obj_size = span.obj_size_bytes();
    if obj_size == 0 || ptr < span.start_address() {
        AllocatorMetrics::tick(&m.escapes_stale_at_commit);
        return;
    }
    let idx = (ptr - span.start_address()) / obj_size;
    if idx >= ESCAPE_TABLE_SLOTS || idx >= span.objects_per_span() as usize {
        return;
    }
    if span.record_escape(idx, loc) {
        AllocatorMetrics::tick(&m.escapes_committed);
    }
}

/// Drains the calling thread's write-combining buffer.
///
/// The instrumented free path calls this so records made just before a
/// free are visible to poisoning.
pub fn flush_pending(g: &Globals) {
    let _ = BUFFER.try_with(|b| {
        let mut buf = b.borrow_mut();
        for (loc, ptr) in buf.entries.drain(..) {
            commit_escape(g, loc, ptr);
        }
    });
}

/// Drops the committed record for `loc` in the chunk owning `ptr`.
///
/// Called by instrumented code when a pointer store overwrites `loc`'s old
/// value `ptr`.
pub fn clear_old_escape(g: &Globals, ptr: usize, loc: usize) {
    let Some(span) = g.pagemap.descriptor(page_containing(ptr)) else {
        return;
    };
    span.prefetch();
    // Free-list spans keep page-map entries but carry no escape list.
    let obj_size = span.obj_size_bytes();
    if obj_size == 0 || ptr < span.start_address() {
        return;
    }
    let idx = (ptr - span.start_address()) / obj_size;
    if idx >= span.objects_per_span() as usize {
        return;
    }
    span.remove_escape(idx, loc);
}

/// Poisons every recorded location that still points into
/// `[chunk_lo, chunk_hi)`, then releases the chunk's records.
///
/// Re-validation before stamping is what keeps reused locations intact:
/// a record whose storage has since been overwritten (or freed and
/// recycled) no longer passes the range test.
pub(crate) fn poison_escapes(
    g: &Globals,
    span: &Span,
    idx: usize,
    chunk_lo: usize,
    chunk_hi: usize,
) {
    let m = global_metrics();
    for loc in span.take_escape_slot(idx) {
        let Some(cur) = read_location(g, loc) else {
            continue;
        };
        if cur >= chunk_lo && cur < chunk_hi {
            let stamped = (cur & 0xFFFF_FFFF) | POISON_PATTERN;
            // SAFETY: `loc` was heap-owned when recorded, heap memory is
            // never unmapped, and `read_location` has just excluded dead
            // guarded slots.
            unsafe {
                std::ptr::write_volatile(loc as *mut usize, stamped);
            }
            AllocatorMetrics::bump(&m.poisoned_locations);
        }
    }
}

/// Reads the pointer-sized word at `loc`, refusing locations inside the
/// guarded pool whose slot is no longer live (their pages are `PROT_NONE`).
fn read_location(g: &Globals, loc: usize) -> Option<usize> {
    if g.guarded.pointer_is_mine(loc) && g.guarded.requested_size(loc).is_none() {
        return None;
    }
    // SAFETY: heap reservations stay mapped for the process lifetime and
    // guarded dead slots were excluded above.
    Some(unsafe { std::ptr::read_volatile(loc as *const usize) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poison_pattern_occupies_the_high_half() {
        assert_eq!(POISON_PATTERN >> 32, 0xDEAD_BEEF);
        assert_eq!(POISON_PATTERN & 0xFFFF_FFFF, 0);
        let stamped = (0x1234_5678_9ABCusize & 0xFFFF_FFFF) | POISON_PATTERN;
        assert_eq!(stamped >> 32, 0xDEAD_BEEF);
        assert_eq!(stamped & 0xFFFF_FFFF, 0x5678_9ABC);
    }
}
