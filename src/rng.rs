//! PCG32 (XSH-RR variant, 64-bit state) with just enough surface for fault injection.
//!
//! ```rust
//! use netplay_rollback::rng::{Pcg32, Rng, SeedableRng};
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.gen_range(0..100), b.gen_range(0..100));
//! ```
//!
//! Not cryptographically secure.

use crate::{
    report_violation,
    telemetry::{ViolationKind, ViolationSeverity},
};

/// PCG32 random number generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

/// Stream used by [`SeedableRng::seed_from_u64`].
const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;

/// LCG multiplier for 64-bit state.
const PCG_MULTIPLIER: u64 = 6364136223846793005;

impl Pcg32 {
    /// Creates a generator for `state` on the given stream.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Generates the next 32-bit value.
    #[inline]
    #[must_use]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

/// Deterministic construction from a seed.
pub trait SeedableRng: Sized {
    /// Creates a generator from a 64-bit seed.
    #[must_use]
    fn seed_from_u64(seed: u64) -> Self;

    /// Creates a generator seeded from the wall clock.
    #[must_use]
    fn from_entropy() -> Self;
}

impl SeedableRng for Pcg32 {
    fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_STREAM)
    }

    fn from_entropy() -> Self {
        let nanos = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::seed_from_u64(nanos ^ 0x9E37_79B9_7F4A_7C15)
    }
}

/// Random value generation on top of a 32-bit source.
pub trait Rng {
    /// Returns the next 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// Uniform `u32` in `[start, end)`.
    ///
    /// An empty range is reported as a violation and yields `range.start`.
    fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.wrapping_sub(range.start);
        if range.is_empty() {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::Configuration,
                "gen_range called with empty range [{}..{})",
                range.start,
                range.end
            );
            return range.start;
        }

        // rejection sampling keeps the distribution unbiased
        let threshold = span.wrapping_neg() % span;
        loop {
            let value = self.next_u32();
            if value >= threshold {
                return range.start.wrapping_add(value % span);
            }
        }
    }

    /// `true` with the given probability, clamped to `[0.0, 1.0]`.
    fn gen_bool(&mut self, probability: f64) -> bool {
        let p = probability.clamp(0.0, 1.0);
        if p >= 1.0 {
            return true;
        }
        let threshold = (p * f64::from(u32::MAX)) as u32;
        self.next_u32() < threshold
    }
}

impl Rng for Pcg32 {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        Self::next_u32(self)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Pcg32::seed_from_u64(42);
        let mut b = Pcg32::seed_from_u64(42);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Pcg32::seed_from_u64(1);
        let mut b = Pcg32::seed_from_u64(2);
        let same = (0..32).filter(|_| a.next_u32() == b.next_u32()).count();
        assert!(same < 4);
    }

    #[test]
    fn gen_range_stays_in_bounds() {
        let mut rng = Pcg32::seed_from_u64(9);
        for _ in 0..1000 {
            let v = rng.gen_range(10..20);
            assert!((10..20).contains(&v));
        }
    }

    #[test]
    fn gen_range_single_value() {
        let mut rng = Pcg32::seed_from_u64(9);
        assert_eq!(rng.gen_range(5..6), 5);
    }

    #[test]
    fn gen_range_empty_returns_start() {
        let mut rng = Pcg32::seed_from_u64(9);
        assert_eq!(rng.gen_range(7..7), 7);
    }

    #[test]
    fn gen_bool_extremes() {
        let mut rng = Pcg32::seed_from_u64(3);
        for _ in 0..100 {
            assert!(!rng.gen_bool(0.0));
            assert!(rng.gen_bool(1.0));
            assert!(!rng.gen_bool(-2.0));
            assert!(rng.gen_bool(5.0));
        }
    }

    #[test]
    fn gen_bool_roughly_matches_probability() {
        let mut rng = Pcg32::seed_from_u64(11);
        let hits = (0..10_000).filter(|_| rng.gen_bool(0.25)).count();
        assert!((2_000..3_000).contains(&hits), "hits = {hits}");
    }
}
