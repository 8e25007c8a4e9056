//! Error taxonomy and violation reporting.
//!
//! Resource exhaustion and programmer errors surface as `AllocError` and
//! never propagate beyond the entry point. Memory-safety violations are
//! reported and counted; when `crash-on-corruption` is configured they
//! abort the process. They never unwind.

use thiserror::Error;

use crate::config;
use crate::metrics::{global_metrics, AllocatorMetrics};

/// Errors produced by allocation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Requested size overflows internal arithmetic.
    #[error("requested size overflows")]
    SizeOverflow,
    /// Alignment is not a power of two or not a multiple of the pointer
    /// size where the entry point requires it.
    #[error("invalid alignment: {0}")]
    InvalidAlignment(usize),
    /// The page allocator could not satisfy the request.
    #[error("out of memory")]
    Exhausted,
    /// A hard memory limit rejected the request.
    #[error("hard memory limit exceeded")]
    LimitExceeded,
}

/// A detected memory-safety violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    /// Free of a pointer not at a chunk boundary.
    #[error("double/invalid free detected at {addr:#x}")]
    InvalidFree { addr: usize },
    /// Free of a pointer carrying the poison sentinel.
    #[error("double/invalid free of poisoned pointer {addr:#x}")]
    PoisonedFree { addr: usize },
    /// Free of a pointer with no span descriptor.
    #[error("freeing a pointer with no span: {addr:#x}")]
    UnknownFree { addr: usize },
    /// Out-of-bounds access caught by a boundary check.
    #[error("OOB detected: base {base:#x} access [{addr:#x}, {addr:#x}+{size:#x})")]
    OutOfBounds { base: usize, addr: usize, size: usize },
    /// Out-of-bounds copy caught by a checked string primitive.
    #[error("OOB detected in checked string op at {addr:#x}")]
    StringOutOfBounds { addr: usize },
}

/// Reports a safety violation per the configured policy.
///
/// Counts unconditionally, logs when `error-report` is on, aborts when
/// `crash-on-corruption` is on. Returns to the caller otherwise so the
/// offending operation can be skipped.
pub fn report_violation(v: SafetyViolation) {
    AllocatorMetrics::bump(&global_metrics().violations);
    if config::error_report_enabled() {
        tracing::error!("{v}");
    }
    if config::crash_on_corruption() {
        crash_now();
    }
}

/// Explicit report entry used by instrumented code (`report_error`).
pub fn report_error() {
    if config::protection_enabled() {
        report_violation(SafetyViolation::OutOfBounds {
            base: 0,
            addr: 0,
            size: 0,
        });
    }
}

/// Terminal handler for throwing allocation paths that ran out of memory.
///
/// Nothrow paths return `None` instead of reaching this.
pub fn handle_oom(size: usize) -> ! {
    tracing::error!("allocation of {size} bytes failed; aborting");
    std::process::abort();
}

fn crash_now() -> ! {
    use std::io::Write as _;
    let _ = std::io::stdout().flush();
    std::process::abort();
}
