//! # rampart-core
//!
//! Core of a safety-instrumented thread-caching allocator: a
//! `malloc`/`free` replacement that also maintains per-object metadata for
//! constant-time spatial bounds checks, pointer-escape tracking that
//! poisons dangling references on free, and runtime-checked string
//! primitives.
//!
//! # Architecture
//!
//! - **Page map** (`pagemap`): address → (size class, span start) in one
//!   packed word per page.
//! - **Spans** (`span`): descriptors for contiguous page runs, carrying
//!   chunk layout, escape lists, and sampling state.
//! - **Size map** (`size_map`): static request-size → class table with a
//!   disjoint cold-hinted range.
//! - **Page allocator** (`page_allocator`): span free lists over a narrow
//!   region-factory interface (`region`).
//! - **Two-tier caches** (`thread_cache`, `transfer_cache`): lock-free
//!   per-thread magazines over per-class central pools.
//! - **Sampling** (`sampler`, `guarded`): Poisson-sampled allocations,
//!   optionally placed in page-isolated guarded slots.
//! - **Escape tracking** (`escape`): write-combined records of which
//!   locations hold pointers into which chunks, poisoned on free.
//! - **Checked strings** (`strings`): chunk-bounded `strcpy`/`strcat`
//!   variants.
//!
//! # Synchronization
//!
//! 1. Thread-local caches and buffers are accessed only by their owning
//!    thread, without locks.
//! 2. One lock per central free list, never held across classes.
//! 3. The page allocator, span lifecycle, and page-map writes are
//!    protected by the page-heap lock; page-map reads take no lock beyond
//!    the shared leaf directory.
//! 4. Cross-thread visibility of a pointer's metadata rides on whatever
//!    synchronization the application used to hand the pointer over.

#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod error;
pub mod escape;
pub mod guarded;
pub mod metrics;
pub mod page_allocator;
pub mod pagemap;
pub mod pages;
pub mod region;
pub mod sampler;
pub mod size_map;
pub mod span;
pub mod strings;
pub mod thread_cache;
pub mod transfer_cache;

pub use allocator::{
    allocate, allocate_sized, allocate_with, bc_check_boundary, clear_old_escape, deallocate,
    deallocate_sized, escape as record_escape, get_allocated_address_ranges, get_chunk_end,
    get_chunk_range, get_chunk_start, get_numeric_property, get_ownership, get_size,
    gep_check_boundary, mark_thread_idle, memory_limit, nallocx, reallocate, release_cpu_memory,
    release_memory_to_system, set_memory_limit, AllocPolicy, Ownership, NON_HEAP_SENTINEL,
};
pub use error::{report_error, AllocError, SafetyViolation};
pub use escape::POISON_PATTERN;
pub use metrics::{global_metrics, report_statistics, MetricsSnapshot};
pub use size_map::AccessHint;
pub use strings::{strcat_check, strcpy_check, strncat_check, strncpy_check};
