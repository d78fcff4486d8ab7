//! Deterministic random source.
//!
//! Every stochastic decision in a run draws from a [`DeterministicRng`]. The
//! root stream is keyed by the run seed; components, edges, faults and the
//! workload each get a child stream forked by a stable label, so adding an
//! unrelated component never shifts another component's draws.

use archsim_types::{DistributionConfig, Hash};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::distribution;

/// Position of a stream, for rewinding it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngCheckpoint {
    key: [u8; 32],
    word_pos: u128,
}

/// A seeded ChaCha8 stream that can fork independent children.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    key: [u8; 32],
    rng: ChaCha8Rng,
}

impl DeterministicRng {
    /// Root stream for a seed string.
    pub fn from_seed_str(seed: &str) -> Self {
        Self::from_key(*Hash::from_bytes(seed.as_bytes()).as_bytes())
    }

    pub fn from_key(key: [u8; 32]) -> Self {
        Self {
            key,
            rng: ChaCha8Rng::from_seed(key),
        }
    }

    /// Uniform draw on `[0, 1)`.
    pub fn next(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    pub fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    /// `true` with probability `p`. Never draws for `p <= 0` or `p >= 1`.
    pub fn chance(&mut self, p: f64) -> bool {
        if p <= 0.0 || p.is_nan() {
            false
        } else if p >= 1.0 {
            true
        } else {
            self.next() < p
        }
    }

    /// Uniform index in `0..n`. Returns 0 for `n == 0` without drawing.
    pub fn below(&mut self, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        self.rng.gen_range(0..n)
    }

    /// Sample a value from a distribution descriptor.
    pub fn from_distribution(&mut self, dist: &DistributionConfig) -> f64 {
        distribution::sample(dist, self)
    }

    /// Child stream keyed by `(this key, sub_seed)`.
    ///
    /// Does not consume any draws from `self`.
    pub fn fork(&self, sub_seed: u64) -> Self {
        let key = Hash::from_parts(&[&self.key, &sub_seed.to_le_bytes()]);
        Self::from_key(*key.as_bytes())
    }

    /// Child stream for a stable name such as `component:api`.
    pub fn fork_labeled(&self, label: &str, index: u64) -> Self {
        self.fork(derive_sub_seed(label, index))
    }

    pub fn checkpoint(&self) -> RngCheckpoint {
        RngCheckpoint {
            key: self.key,
            word_pos: self.rng.get_word_pos(),
        }
    }

    /// Rewind (or fast-forward) to a checkpoint.
    pub fn restore(&mut self, checkpoint: &RngCheckpoint) {
        let mut rng = ChaCha8Rng::from_seed(checkpoint.key);
        rng.set_word_pos(checkpoint.word_pos);
        self.key = checkpoint.key;
        self.rng = rng;
    }
}

/// Sub-seed for a named stream.
pub fn derive_sub_seed(label: &str, index: u64) -> u64 {
    Hash::from_parts(&[label.as_bytes(), &index.to_le_bytes()]).as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = DeterministicRng::from_seed_str("seed-1");
        let mut b = DeterministicRng::from_seed_str("seed-1");
        for _ in 0..100 {
            assert_eq!(a.next().to_bits(), b.next().to_bits());
        }
    }

    #[test]
    fn test_draws_in_unit_interval() {
        let mut rng = DeterministicRng::from_seed_str("unit");
        for _ in 0..10_000 {
            let x = rng.next();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_fork_does_not_consume_parent() {
        let mut parent = DeterministicRng::from_seed_str("parent");
        let mut untouched = parent.clone();
        let _child = parent.fork(7);
        assert_eq!(parent.next().to_bits(), untouched.next().to_bits());
    }

    #[test]
    fn test_fork_is_label_stable() {
        let root = DeterministicRng::from_seed_str("root");
        let mut a = root.fork_labeled("component:api", 0);
        let mut b = root.fork_labeled("component:api", 0);
        let mut c = root.fork_labeled("component:db", 0);
        let x = a.next();
        assert_eq!(x.to_bits(), b.next().to_bits());
        assert_ne!(x.to_bits(), c.next().to_bits());
    }

    #[test]
    fn test_checkpoint_restore_replays() {
        let mut rng = DeterministicRng::from_seed_str("replay");
        rng.next();
        let checkpoint = rng.checkpoint();
        let first: Vec<u64> = (0..5).map(|_| rng.next_u64()).collect();
        rng.restore(&checkpoint);
        let second: Vec<u64> = (0..5).map(|_| rng.next_u64()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_chance_edges_do_not_draw() {
        let mut a = DeterministicRng::from_seed_str("edges");
        let mut b = a.clone();
        assert!(!a.chance(0.0));
        assert!(a.chance(1.0));
        assert_eq!(a.next().to_bits(), b.next().to_bits());
    }
}
