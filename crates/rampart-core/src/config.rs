//! Build-time switches and runtime tunables.
//!
//! The compile-time switches are Cargo features; they are probed through
//! `cfg!` so that every configuration type-checks. The runtime tunables are
//! read once from the environment and may be overridden programmatically
//! through the introspection surface.
//!
//! - `RAMPART_SAMPLE_INTERVAL`: mean bytes between sampled allocations,
//!   0 disables sampling (default 0).
//! - `RAMPART_GUARDED_INTERVAL`: take every Nth sample as a guarded-page
//!   allocation, 0 disables guarding (default 8).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Whether the protection layer (padding, free validation, escapes,
/// poisoning, boundary checks) is compiled in.
#[inline]
#[must_use]
pub const fn protection_enabled() -> bool {
    cfg!(feature = "protection")
}

/// Whether safety-violation reports are emitted.
#[inline]
#[must_use]
pub const fn error_report_enabled() -> bool {
    cfg!(feature = "error-report")
}

/// Whether a reported violation aborts the process.
#[inline]
#[must_use]
pub const fn crash_on_corruption() -> bool {
    cfg!(feature = "crash-on-corruption")
}

/// Whether hot-path statistic counters are maintained.
#[inline]
#[must_use]
pub const fn statistic_enabled() -> bool {
    cfg!(feature = "statistic")
}

struct Tunables {
    sample_interval: AtomicU64,
    guarded_interval: AtomicU64,
}

fn tunables() -> &'static Tunables {
    static TUNABLES: OnceLock<Tunables> = OnceLock::new();
    TUNABLES.get_or_init(|| Tunables {
        sample_interval: AtomicU64::new(env_u64("RAMPART_SAMPLE_INTERVAL", 0)),
        guarded_interval: AtomicU64::new(env_u64("RAMPART_GUARDED_INTERVAL", 8)),
    })
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Mean bytes between sampled allocations; 0 means sampling is off.
#[must_use]
pub fn sample_interval() -> u64 {
    tunables().sample_interval.load(Ordering::Relaxed)
}

/// Sets the mean bytes between sampled allocations (0 disables).
///
/// Threads pick the new interval up when their sampler reseeds.
pub fn set_sample_interval(bytes: u64) {
    tunables().sample_interval.store(bytes, Ordering::Relaxed);
}

/// Every Nth sample is taken guarded; 0 disables guarded sampling.
#[must_use]
pub fn guarded_interval() -> u64 {
    tunables().guarded_interval.load(Ordering::Relaxed)
}

/// Sets the guarded sampling cadence (0 disables).
pub fn set_guarded_interval(n: u64) {
    tunables().guarded_interval.store(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        // The default is off unless the environment says otherwise; either
        // way the setter round-trips.
        let before = sample_interval();
        set_sample_interval(before);
        assert_eq!(sample_interval(), before);

        let g = guarded_interval();
        set_guarded_interval(g);
        assert_eq!(guarded_interval(), g);
    }

    #[test]
    fn feature_probes_are_consistent() {
        // crash-on-corruption is meaningless without reporting compiled in,
        // but both probes must always answer.
        let _ = protection_enabled();
        let _ = error_report_enabled();
        let _ = crash_on_corruption();
        let _ = statistic_enabled();
    }
}
