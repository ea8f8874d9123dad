//! Seeded random source with a draw counter.
//!
//! Every uniform draw is counted so that a document can pin its random consumption with
//! `_random_count` / `<?random_count n>` checkpoints: a replay with the same seed stays
//! in lock-step with a previous run even when the logic between checkpoints changed.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::error::PromptError;

#[derive(Debug, Clone)]
pub struct PromptRandom {
    rng: StdRng,
    seed: Option<u64>,
    /// Draws since the last checkpoint.
    count: u64,
    total: u64,
}

impl PromptRandom {
    /// A `None` seed draws from system entropy, which makes the run non-reproducible.
    pub fn new(seed: Option<u64>) -> PromptRandom {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        PromptRandom {
            rng,
            seed,
            count: 0,
            total: 0,
        }
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_draws(&self) -> u64 {
        self.total
    }

    /// One uniform draw in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        self.count += 1;
        self.total += 1;
        self.rng.gen::<f64>()
    }

    /// Uniform index in `0..len`. Consumes one draw unless `len` is zero.
    pub fn choose_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let idx = (self.next_f64() * len as f64) as usize;
        Some(idx.min(len - 1))
    }

    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        self.choose_index(items.len()).map(|idx| &items[idx])
    }

    /// Weighted index via cumulative-weight bisection. Consumes exactly one draw.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> Result<usize, PromptError> {
        if weights.is_empty() {
            return Err(PromptError::InvalidWeights(
                "cannot choose from an empty population".to_string(),
            ));
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(PromptError::InvalidWeights(format!(
                "weight {bad} in {weights:?} is not a finite non-negative number"
            )));
        }
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut total = 0.0;
        for weight in weights {
            total += weight;
            cumulative.push(total);
        }
        if total <= 0.0 {
            return Err(PromptError::InvalidWeights(format!(
                "total of weights {weights:?} must be greater than zero"
            )));
        }
        let target = self.next_f64() * total;
        let idx = cumulative.partition_point(|cum| *cum <= target);
        Ok(idx.min(weights.len() - 1))
    }

    /// Independent retention draw: true with the given probability. Consumes one draw.
    pub fn keep(&mut self, probability: f64) -> bool {
        self.next_f64() < probability
    }

    /// Fast-forwards to `count` draws since the previous checkpoint and opens a new one.
    pub fn set_count(&mut self, count: u64) -> Result<(), PromptError> {
        tracing::debug!("RandomCount: {} -> {}", self.count, count);
        if count < self.count {
            return Err(PromptError::RandomCount {
                requested: count,
                current: self.count,
            });
        }
        for _ in self.count..count {
            self.next_f64();
        }
        self.count = 0;
        Ok(())
    }
}

impl Default for PromptRandom {
    fn default() -> Self {
        PromptRandom::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = PromptRandom::new(Some(42));
        let mut b = PromptRandom::new(Some(42));
        for _ in 0..16 {
            assert_eq!(a.next_f64(), b.next_f64());
        }
        assert_eq!(a.count(), 16);
        assert_eq!(a.total_draws(), 16);
    }

    #[test]
    fn test_choose_index_counts_one_draw() {
        let mut rand = PromptRandom::new(Some(1));
        assert_eq!(rand.choose_index(0), None);
        assert_eq!(rand.count(), 0);
        let idx = rand.choose_index(3).unwrap();
        assert!(idx < 3);
        assert_eq!(rand.count(), 1);
    }

    #[test]
    fn test_choose_weighted_skips_zero_weights() {
        let mut rand = PromptRandom::new(Some(7));
        for _ in 0..64 {
            let idx = rand.choose_weighted(&[0.0, 2.0, 0.0]).unwrap();
            assert_eq!(idx, 1);
        }
        assert_eq!(rand.count(), 64);
    }

    #[test]
    fn test_choose_weighted_rejects_bad_weights() {
        let mut rand = PromptRandom::new(Some(7));
        assert!(rand.choose_weighted(&[]).is_err());
        assert!(rand.choose_weighted(&[0.0, 0.0]).is_err());
        assert!(rand.choose_weighted(&[1.0, -1.0]).is_err());
        assert!(rand.choose_weighted(&[f64::NAN]).is_err());
        assert_eq!(rand.count(), 0);
    }

    #[test]
    fn test_keep_extremes() {
        let mut rand = PromptRandom::new(Some(9));
        for _ in 0..64 {
            assert!(rand.keep(1.0));
            assert!(!rand.keep(0.0));
        }
    }

    #[test]
    fn test_set_count_fast_forwards_and_checkpoints() {
        let mut replay = PromptRandom::new(Some(5));
        replay.next_f64();
        replay.set_count(4).unwrap();
        assert_eq!(replay.count(), 0);
        assert_eq!(replay.total_draws(), 4);

        let mut reference = PromptRandom::new(Some(5));
        for _ in 0..4 {
            reference.next_f64();
        }
        assert_eq!(replay.next_f64(), reference.next_f64());
    }

    #[test]
    fn test_set_count_behind_is_an_error() {
        let mut rand = PromptRandom::new(Some(5));
        rand.next_f64();
        rand.next_f64();
        let err = rand.set_count(1).unwrap_err();
        assert_eq!(
            err,
            PromptError::RandomCount {
                requested: 1,
                current: 2
            }
        );
    }
}
