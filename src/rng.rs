//! Minimal PCG32 (XSH-RR, 64-bit state) generator.
//!
//! Used for handshake nonces and session magic numbers. Not cryptographically secure.
//!
//! ```
//! use rampart_rollback::rng::Pcg32;
//!
//! let mut a = Pcg32::seed_from_u64(7);
//! let mut b = Pcg32::seed_from_u64(7);
//! assert_eq!(a.next_u32(), b.next_u32());
//! assert!(a.gen_range(10..20) >= 10);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;
const PCG_MULTIPLIER: u64 = 6364136223846793005;

/// PCG32 random number generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    /// Creates a generator from a state and a stream selector.
    #[must_use]
    pub const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    /// Creates a deterministic generator from a seed.
    #[must_use]
    pub const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    /// Creates a generator seeded from wall-clock time, thread identity and a process-wide
    /// counter, so two generators created in the same instant still differ.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }

    /// Next 32-bit value.
    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        let old_state = self.state;
        self.state = old_state
            .wrapping_mul(PCG_MULTIPLIER)
            .wrapping_add(self.inc);
        let xorshifted = (((old_state >> 18) ^ old_state) >> 27) as u32;
        let rot = (old_state >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Next 16-bit value, taken from the high bits.
    #[inline]
    pub fn next_u16(&mut self) -> u16 {
        (self.next_u32() >> 16) as u16
    }

    /// Uniform value in `range` using rejection sampling. An empty range yields its start.
    pub fn gen_range(&mut self, range: std::ops::Range<u32>) -> u32 {
        let span = range.end.saturating_sub(range.start);
        if span == 0 {
            return range.start;
        }
        let zone = u32::MAX - (u32::MAX % span);
        loop {
            let value = self.next_u32();
            if value < zone {
                return range.start + value % span;
            }
        }
    }
}

static ENTROPY_COUNTER: AtomicU64 = AtomicU64::new(0);

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn entropy_seed() -> u64 {
    let nanos = web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let thread = format!("{:?}", std::thread::current().id());
    let thread_hash = u64::from(crate::checksum::fnv1a32(thread.as_bytes()));
    let counter = ENTROPY_COUNTER.fetch_add(1, Ordering::Relaxed);
    splitmix64(nanos ^ thread_hash.rotate_left(32) ^ splitmix64(counter))
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
            let v = rng.gen_range(5..9);
            assert!((5..9).contains(&v));
        }
        assert_eq!(rng.gen_range(3..3), 3);
    }

    #[test]
    fn entropy_generators_differ() {
        let mut a = Pcg32::from_entropy();
        let mut b = Pcg32::from_entropy();
        let a_values: Vec<u32> = (0..4).map(|_| a.next_u32()).collect();
        let b_values: Vec<u32> = (0..4).map(|_| b.next_u32()).collect();
        assert_ne!(a_values, b_values);
    }
}
