//! Explicit, seedable randomness for every pipeline stage.
//!
//! Nothing in the crate touches a global RNG. A run owns one [`RandomSource`]
//! and hands each stage its own child stream via [`RandomSource::stream`], so
//! changing how many draws augmentation makes never shifts the train/val
//! split or the weight initialization.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

#[derive(Clone, Debug)]
pub struct RandomSource {
    seed: u64,
    rng: ChaCha8Rng,
}

impl RandomSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Independent child stream keyed by a stage name.
    ///
    /// Derived only from the root seed and the name (FNV-1a), never from the
    /// parent's current position.
    pub fn stream(&self, stage: &str) -> RandomSource {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in stage.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        RandomSource::new(self.seed ^ hash)
    }

    /// Uniform in `[low, high)`.
    pub fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if high <= low {
            return low;
        }
        self.rng.gen_range(low..high)
    }

    /// Zero-mean Gaussian with the given standard deviation (0 gives exactly 0).
    pub fn normal(&mut self, std_dev: f64) -> f64 {
        if std_dev == 0.0 {
            return 0.0;
        }
        let z: f64 = self.rng.sample(StandardNormal);
        z * std_dev
    }

    /// Uniform index in `0..len`. `len` must be non-zero.
    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    /// Bernoulli draw with success probability `p`.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.rng.gen::<f64>() < p
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }

    /// Shuffled `0..len`.
    pub fn permutation(&mut self, len: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..len).collect();
        self.shuffle(&mut idx);
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = RandomSource::new(10);
        let mut b = RandomSource::new(10);
        for _ in 0..20 {
            assert_eq!(a.uniform(0.0, 1.0), b.uniform(0.0, 1.0));
        }
    }

    #[test]
    fn test_streams_are_independent_of_parent_position() {
        let root = RandomSource::new(7);
        let mut advanced = root.clone();
        for _ in 0..100 {
            advanced.normal(1.0);
        }
        let mut s1 = root.stream("split");
        let mut s2 = advanced.stream("split");
        assert_eq!(s1.permutation(16), s2.permutation(16));
    }

    #[test]
    fn test_streams_differ_by_name() {
        let root = RandomSource::new(7);
        let mut a = root.stream("augment");
        let mut b = root.stream("split");
        let xs: Vec<f64> = (0..8).map(|_| a.uniform(0.0, 1.0)).collect();
        let ys: Vec<f64> = (0..8).map(|_| b.uniform(0.0, 1.0)).collect();
        assert_ne!(xs, ys);
    }

    #[test]
    fn test_zero_std_normal() {
        let mut rng = RandomSource::new(1);
        assert_eq!(rng.normal(0.0), 0.0);
    }

    #[test]
    fn test_permutation_is_complete() {
        let mut rng = RandomSource::new(3);
        let mut p = rng.permutation(50);
        p.sort_unstable();
        assert_eq!(p, (0..50).collect::<Vec<_>>());
    }
}
