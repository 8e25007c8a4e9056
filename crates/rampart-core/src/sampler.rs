//! Per-thread Poisson sampler deciding which allocations to instrument.
//!
//! Each thread runs a bytes-until-next-sample counter. Allocations
//! decrement it by their requested size; on underflow the allocation is
//! sampled with a weight equal to the configured mean inter-sample byte
//! count, and the counter reseeds from an exponential draw so samples form
//! a Poisson process over allocated bytes. Sampling is purely
//! observational: no cancellation, no timeouts.
//!
//! The generator is a hand-rolled SplitMix64; this is not a cryptographic
//! application, the goal is a cheap well-mixed stream.

use std::cell::RefCell;
use std::hash::{Hash, Hasher};

use crate::config;

/// Per-thread sampling state.
pub struct Sampler {
    bytes_until_sample: i64,
    rng: u64,
    samples_until_guarded: u64,
    seeded: bool,
}

impl Sampler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bytes_until_sample: 0,
            rng: seed_for_thread(),
            samples_until_guarded: 0,
            seeded: false,
        }
    }

    /// Records an allocation of `size` bytes. Returns the sampling weight
    /// when this allocation should be sampled, 0 otherwise.
    pub fn record_allocation(&mut self, size: usize) -> usize {
        let mean = config::sample_interval();
        if mean == 0 {
            self.seeded = false;
            return 0;
        }
        if !self.seeded {
            self.bytes_until_sample = self.draw_period(mean);
            self.seeded = true;
        }
        self.bytes_until_sample -= size as i64;
        if self.bytes_until_sample > 0 {
            return 0;
        }
        self.bytes_until_sample = self.draw_period(mean);
        mean as usize
    }

    /// Separate, lower-frequency decision: take every Nth sample guarded.
    pub fn should_sample_guarded(&mut self) -> bool {
        let every = config::guarded_interval();
        if every == 0 {
            return false;
        }
        if self.samples_until_guarded > 1 {
            self.samples_until_guarded -= 1;
            return false;
        }
        self.samples_until_guarded = every;
        true
    }

    /// Exponential draw with the given mean, clamped to `[1, 32 * mean]`.
    fn draw_period(&mut self, mean: u64) -> i64 {
        let u = (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64;
        let period = -(1.0 - u).ln() * mean as f64;
        let max = (mean as i64).saturating_mul(32);
        (period as i64).clamp(1, max.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        self.rng = self.rng.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.rng;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

fn seed_for_thread() -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    hasher.finish() | 1
}

thread_local! {
    static SAMPLER: RefCell<Sampler> = RefCell::new(Sampler::new());
}

/// Accesses the calling thread's sampler.
pub fn with_sampler<R>(f: impl FnOnce(&mut Sampler) -> R) -> R {
    SAMPLER.with(|s| f(&mut s.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_sampler_never_fires() {
        // The global default in the test environment is whatever the
        // config says; drive the state machine directly with mean 0 by
        // checking the config-off path.
        if config::sample_interval() == 0 {
            let mut s = Sampler::new();
            for _ in 0..1000 {
                assert_eq!(s.record_allocation(4096), 0);
            }
        }
    }

    #[test]
    fn draw_period_stays_in_range() {
        let mut s = Sampler::new();
        for mean in [1u64, 64, 1 << 20] {
            for _ in 0..200 {
                let p = s.draw_period(mean);
                assert!(p >= 1);
                assert!(p <= (mean as i64) * 32);
            }
        }
    }

    #[test]
    fn guarded_cadence_counts_samples() {
        let mut s = Sampler::new();
        if config::guarded_interval() == 8 {
            // First decision fires, then every 8th.
            assert!(s.should_sample_guarded());
            let mut fired = 0;
            for _ in 0..16 {
                if s.should_sample_guarded() {
                    fired += 1;
                }
            }
            assert_eq!(fired, 2);
        }
    }

    #[test]
    fn splitmix_is_well_mixed() {
        let mut s = Sampler::new();
        let a = s.next_u64();
        let b = s.next_u64();
        assert_ne!(a, b);
        assert_ne!(a.count_ones(), 0);
    }
}
