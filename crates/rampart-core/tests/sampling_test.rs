//! Sampled and guarded allocation paths, end to end.
//!
//! One sequential test: the sampling tunables are process-wide, so the
//! scenarios share a single `#[test]` to keep them ordered.

use rampart_core::allocator::globals;
use rampart_core::config::{set_guarded_interval, set_sample_interval};
use rampart_core::pages::PAGE_SIZE;
use rampart_core::{
    allocate, bc_check_boundary, deallocate, get_numeric_property, get_ownership, get_size,
    record_escape, Ownership,
};

fn write_word(addr: usize, val: usize) {
    // SAFETY: tests only write words into allocations they own.
    unsafe { (addr as *mut usize).write_volatile(val) }
}

fn read_word(addr: usize) -> usize {
    // SAFETY: tests only read words from allocations they own.
    unsafe { (addr as *const usize).read_volatile() }
}

fn sampled_count() -> u64 {
    get_numeric_property("sampled_allocations").expect("property")
}

#[test]
fn sampled_and_guarded_allocations_end_to_end() {
    // Sample every allocation; no guarded slots yet.
    set_guarded_interval(0);
    set_sample_interval(1);

    // The escape slot below is allocated first; it is sampled too (every
    // allocation is), so take the baseline count after it exists.
    let slot = allocate(8).expect("slot");

    // --- Sampled small allocation -------------------------------------
    let before = sampled_count();
    let p = allocate(100).expect("alloc");
    assert_eq!(p % PAGE_SIZE, 0, "sampled objects are page-aligned");
    assert_eq!(get_size(p), 112, "class size survives sampling");
    assert_eq!(get_ownership(p), Ownership::Owned);
    assert!(sampled_count() > before);

    // The recorder carries the metadata, including the pinned proxy.
    let mut seen_proxy = false;
    globals().sample_recorder().iterate(|sa| {
        if sa.span_start == p {
            assert_eq!(sa.requested_size, 100);
            assert_eq!(sa.allocated_size, 112);
            assert!(sa.weight > 0);
            seen_proxy = sa.proxy.is_some();
        }
    });
    assert!(seen_proxy, "class-sampled objects keep a proxy");

    // Bounds checks work off the sampled span's layout.
    assert_eq!(bc_check_boundary(p, 112), 0);
    assert_eq!(bc_check_boundary(p, 113), -1);

    // Escape tracking covers sampled memory too.
    assert_eq!(record_escape(slot, p), 0);
    write_word(slot, p);
    deallocate(p);
    assert_eq!(read_word(slot) >> 32, 0xDEAD_BEEF);
    assert_eq!(sampled_count(), before);
    deallocate(slot);

    // --- Sampled large allocation -------------------------------------
    let before = sampled_count();
    let big = allocate(0x2000).expect("alloc");
    assert_eq!(get_size(big), 0x2000);
    assert!(sampled_count() > before);
    deallocate(big);
    assert_eq!(sampled_count(), before);

    // --- Guarded sampled allocation -----------------------------------
    set_guarded_interval(1);
    let g = allocate(80).expect("alloc");
    // The object sits against the trailing guard page.
    assert_eq!(g % PAGE_SIZE, PAGE_SIZE - 80);
    assert_eq!(get_size(g), 80, "guarded objects report the requested size");
    assert_eq!(get_ownership(g), Ownership::Owned);
    // SAFETY: all 80 requested bytes are readable and writable.
    unsafe { std::ptr::write_bytes(g as *mut u8, 0x77, 80) };

    // Misaligned frees of guarded memory are rejected, exact frees work.
    let violations_before = rampart_core::global_metrics().snapshot().violations;
    deallocate(g + 8);
    assert!(rampart_core::global_metrics().snapshot().violations > violations_before);
    assert_eq!(get_ownership(g), Ownership::Owned);
    deallocate(g);
    assert_eq!(get_ownership(g), Ownership::NotOwned);

    // Slot reuse: the pool recycles after free.
    let g2 = allocate(80).expect("alloc");
    assert_eq!(g2 % PAGE_SIZE, PAGE_SIZE - 80);
    deallocate(g2);

    // Back to quiescent defaults for any test that follows in-process.
    set_guarded_interval(0);
    set_sample_interval(0);
}
