//! End-to-end safety instrumentation coverage: boundary checks, escape
//! recording, free-time poisoning, and invalid-free handling.
//!
//! Escape locations live in heap memory allocated from this allocator;
//! stores to non-heap locations are uninteresting to the tracker by
//! design.

use rampart_core::{
    allocate, bc_check_boundary, clear_old_escape, deallocate, get_chunk_end, get_chunk_range,
    get_chunk_start, get_ownership, get_size, gep_check_boundary, global_metrics, nallocx,
    record_escape, Ownership, NON_HEAP_SENTINEL, POISON_PATTERN,
};

fn write_word(addr: usize, val: usize) {
    // SAFETY: tests only write words into allocations they own.
    unsafe { (addr as *mut usize).write_volatile(val) }
}

fn read_word(addr: usize) -> usize {
    // SAFETY: tests only read words from allocations they own (poisoned
    // locations stay mapped).
    unsafe { (addr as *const usize).read_volatile() }
}

fn violations() -> u64 {
    global_metrics().snapshot().violations
}

#[test]
fn size_class_round_trip() {
    let p = allocate(75).expect("alloc");
    assert_eq!(get_size(p), 80);
    assert_eq!(nallocx(75, 0), 80);

    assert_eq!(bc_check_boundary(p, 80), 0);
    assert_eq!(bc_check_boundary(p, 81), -1);
    assert_eq!(gep_check_boundary(p, p, 80), 0);
    assert_eq!(gep_check_boundary(p, p - 1, 1), -1);
    assert_eq!(gep_check_boundary(p, p - 3, 5), -1);
    assert_eq!(gep_check_boundary(p, p - 4, 1), -1);

    assert_eq!((p - get_chunk_start(p)) % 80, 0);
    assert_eq!(get_chunk_end(p), p + 80);
    deallocate(p);
}

#[test]
fn large_allocation_boundary() {
    let p = allocate(0x2000).expect("alloc");
    assert_eq!(get_size(p), 0x2000);
    assert_eq!(bc_check_boundary(p, 0x2000), 0);
    assert_eq!(bc_check_boundary(p, 0x2001), -1);
    deallocate(p);
}

#[test]
fn escape_then_free_poisons_the_location() {
    let slot = allocate(8).expect("slot");

    // A location that stops holding the pointer is left alone.
    let t = allocate(80).expect("alloc");
    assert_eq!(record_escape(slot, t), 0);
    write_word(slot, t);
    write_word(slot, 0x112233);
    deallocate(t);
    assert_eq!(read_word(slot), 0x112233);

    // A location still holding the pointer gets the high-half stamp.
    let t = allocate(80).expect("alloc");
    assert_eq!(record_escape(slot, t), 0);
    write_word(slot, t);
    deallocate(t);
    let val = read_word(slot);
    assert_eq!(val >> 32, 0xDEAD_BEEF);
    assert_eq!(val & 0xFFFF_FFFF, t & 0xFFFF_FFFF);
    assert_eq!(val & POISON_PATTERN, POISON_PATTERN);

    deallocate(slot);
}

#[test]
fn escape_overwrite_suppresses_poison() {
    let slot = allocate(8).expect("slot");

    let t1 = allocate(80).expect("alloc");
    assert_eq!(record_escape(slot, t1), 0);
    write_word(slot, t1);

    let t2 = allocate(0).expect("alloc");
    assert_eq!(record_escape(slot, t2), 0);
    write_word(slot, t2);

    // The slot no longer points into t1's chunk, so freeing t1 must not
    // poison it.
    deallocate(t1);
    assert_eq!(read_word(slot), t2);

    deallocate(read_word(slot));
    deallocate(slot);
}

#[test]
fn dead_escape_record_must_not_poison_reused_memory() {
    let m = allocate(80).expect("alloc");
    let t = allocate(80).expect("alloc");
    assert_eq!(record_escape(m, t), 0);
    write_word(m, t);

    // Free the buffer holding the escape location, then reuse its chunk.
    deallocate(m);
    let data = allocate(80).expect("alloc");
    assert_eq!(data, m, "thread cache reuses the freed chunk LIFO");
    // SAFETY: 80 usable bytes just allocated.
    unsafe { std::ptr::write_bytes(data as *mut u8, b'A', 80) };

    // The record's location no longer points into t's chunk; poisoning
    // must leave the reused memory untouched.
    deallocate(t);
    assert_eq!(read_word(data), 0x4141_4141_4141_4141);
    deallocate(data);
}

#[test]
fn untracked_overwrite_is_harmless() {
    let slot = allocate(8).expect("slot");
    let t1 = allocate(80).expect("alloc");
    let t2 = allocate(80).expect("alloc");

    // Store without telling the tracker, then overwrite with a tracked
    // store; freeing the untracked pointee poisons nothing.
    write_word(slot, t1);
    assert_eq!(record_escape(slot, t2), 0);
    write_word(slot, t2);

    deallocate(t1);
    assert_eq!(read_word(slot), t2);
    deallocate(t2);
    deallocate(slot);
}

#[test]
fn cleared_escape_is_forgotten() {
    let slot = allocate(8).expect("slot");
    let t = allocate(80).expect("alloc");
    assert_eq!(record_escape(slot, t), 0);
    write_word(slot, t);

    // Force the buffered record into the span's list, then drop it the
    // way instrumented code does on overwrite.
    rampart_core::escape::flush_pending(rampart_core::allocator::globals());
    clear_old_escape(t, slot);

    deallocate(t);
    assert_eq!(read_word(slot), t, "no record left, no poison applied");
    deallocate(slot);
}

#[test]
fn non_heap_escape_is_ignored() {
    let t = allocate(80).expect("alloc");
    let mut local: usize = 0;
    // Stack locations are not heap-owned; the tracker refuses them.
    assert_eq!(record_escape(std::ptr::addr_of_mut!(local) as usize, t), -1);
    deallocate(t);

    let slot = allocate(8).expect("slot");
    // A target outside the heap is equally uninteresting.
    assert_eq!(record_escape(slot, 0x4000), -1);
    deallocate(slot);
}

#[test]
fn invalid_free_is_reported_and_skipped() {
    let p = allocate(80).expect("alloc");
    let before = violations();
    deallocate(p + 0x10);
    assert!(violations() > before, "misaligned free must report");

    // The allocation is still intact and properly freeable.
    assert_eq!(get_ownership(p), Ownership::Owned);
    assert_eq!(get_size(p), 96);
    deallocate(p);

    // Same class reuse proves the free list was not corrupted.
    let q = allocate(80).expect("alloc");
    assert_eq!(q, p);
    deallocate(q);
}

#[test]
fn invalid_free_inside_large_span() {
    let p = allocate(0x20_0000).expect("alloc");
    let before = violations();
    deallocate(p + 0x20);
    deallocate(p + 0x2000);
    deallocate(p + 0x20_0000 - 0x3000);
    assert!(violations() >= before + 3);
    assert_eq!(get_ownership(p), Ownership::Owned);
    deallocate(p);
}

#[test]
fn double_free_through_a_poisoned_pointer_is_reported() {
    let slot = allocate(8).expect("slot");
    let t = allocate(80).expect("alloc");
    assert_eq!(record_escape(slot, t), 0);
    write_word(slot, t);
    deallocate(t);

    // The program's only copy of the pointer is poisoned now; freeing
    // through it is recognized by the sentinel in its high bits.
    let dangling = read_word(slot);
    assert_eq!(dangling >> 32, 0xDEAD_BEEF);
    let before = violations();
    deallocate(dangling);
    assert!(violations() > before);

    deallocate(slot);
}

#[test]
fn freeing_foreign_memory_is_reported() {
    let local = 0u64;
    let before = violations();
    deallocate(std::ptr::addr_of!(local) as usize);
    assert!(violations() > before);
}

#[test]
fn chunk_range_for_non_heap_memory_is_the_sentinel() {
    let local = 0u64;
    let addr = std::ptr::addr_of!(local) as usize;
    assert_eq!(get_chunk_range(addr), (0, NON_HEAP_SENTINEL));
    assert_eq!(bc_check_boundary(addr, 8), 1);
    assert_eq!(gep_check_boundary(addr, addr, 8), 1);
}

#[test]
fn escape_churn_under_random_reuse() {
    const SLOTS: usize = 256;
    const ROUNDS: usize = 4096;

    fn lcg(state: &mut u64) -> u64 {
        *state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *state >> 16
    }

    let table = allocate(SLOTS * 8).expect("table");
    let slot = |i: usize| table + i * 8;

    for i in 0..SLOTS {
        let tmp = allocate(128).expect("alloc");
        assert_ne!(tmp, 0);
        record_escape(slot(i), tmp);
        write_word(slot(i), tmp);
    }

    let mut rng = 0xA5A5_5A5A_DEAD_BEEFu64;
    for round in 0..ROUNDS {
        let x = (lcg(&mut rng) as usize) % SLOTS;
        let y = (lcg(&mut rng) as usize) % SLOTS;
        let px = read_word(slot(x));
        let py = read_word(slot(y));
        if px != 0 && px >> 32 != 0xDEAD_BEEF && py >> 32 != 0xDEAD_BEEF {
            // Store object y's address into object x's first word.
            record_escape(px, py);
            write_word(px, py);
        }

        if round % 64 == 0 {
            let z = (lcg(&mut rng) as usize) % SLOTS;
            let tmp = read_word(slot(z));
            if tmp != 0 && tmp >> 32 != 0xDEAD_BEEF {
                write_word(slot(z), 0);
                record_escape(slot(z), 0);
                deallocate(tmp);
            }
        }
    }

    for i in 0..SLOTS {
        let p = read_word(slot(i));
        if p != 0 && p >> 32 != 0xDEAD_BEEF {
            deallocate(p);
        }
    }
    deallocate(table);
}
