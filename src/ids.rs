use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Exclusive upper bound of generated ids.
pub const ID_UPPER_BOUND: u32 = 5;

/// Produces request ids for hello payloads.
pub trait IdGenerator {
    /// Generate `count` ids. Uniqueness is not guaranteed.
    fn generate(&mut self, count: usize) -> Vec<String>;
}

/// Generates small decimal ids in `0..ID_UPPER_BOUND`.
#[derive(Debug, Clone)]
pub struct RandomIds<R = StdRng> {
    rng: R,
}

impl RandomIds {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic generator, mostly useful in tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> IdGenerator for RandomIds<R> {
    fn generate(&mut self, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| self.rng.random_range(0..ID_UPPER_BOUND).to_string())
            .collect()
    }
}
