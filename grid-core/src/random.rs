//! Random number sources
//!
//! Port selection draws through the `Random` trait so tests can supply a
//! seeded source instead of the thread-local one.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Uniform random integers over arbitrary 64-bit ranges
pub trait Random: Send + Sync {
    /// Returns a value in `[min, max)`; `min` when the range is empty
    fn next_i64_in(&self, min: i64, max: i64) -> i64;

    /// Returns a value in `[0.0, 1.0)`
    fn next_f64(&self) -> f64;
}

/// Backed by the calling thread's generator
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLocalRandom;

impl Random for ThreadLocalRandom {
    fn next_i64_in(&self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..max)
    }

    fn next_f64(&self) -> f64 {
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Deterministic source for reproducible sequences
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Random for SeededRandom {
    fn next_i64_in(&self, min: i64, max: i64) -> i64 {
        if min >= max {
            return min;
        }
        self.rng.lock().unwrap().gen_range(min..max)
    }

    fn next_f64(&self) -> f64 {
        self.rng.lock().unwrap().r#gen::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let random = ThreadLocalRandom;
        for _ in 0..1000 {
            let v = random.next_i64_in(45_000, 47_000);
            assert!((45_000..47_000).contains(&v));
        }
    }

    #[test]
    fn test_empty_range_returns_min() {
        assert_eq!(ThreadLocalRandom.next_i64_in(10, 10), 10);
        assert_eq!(SeededRandom::new(1).next_i64_in(7, 3), 7);
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        for _ in 0..32 {
            assert_eq!(a.next_i64_in(i64::MIN, i64::MAX), b.next_i64_in(i64::MIN, i64::MAX));
        }
    }
}
