//! Resource quantities
//!
//! A `GridServerResource` expresses either one instance's limits or the
//! aggregate allocation of every active job.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A quantity of compute resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GridServerResource {
    /// Fractional CPU count
    pub cores: f64,
    pub threads: i64,
    pub memory_mb: i64,
}

impl GridServerResource {
    pub fn new(cores: f64, threads: i64, memory_mb: i64) -> Self {
        Self {
            cores,
            threads,
            memory_mb,
        }
    }

    /// The empty quantity
    pub fn zero() -> Self {
        Self::default()
    }

    /// Returns true when every component is (close enough to) zero
    pub fn is_zero(&self) -> bool {
        self.cores.abs() < 1e-9 && self.threads == 0 && self.memory_mb == 0
    }

    /// Rejects quantities no job may request: non-finite or negative cores,
    /// negative threads or memory
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.cores.is_finite() {
            return Err("cores must be a finite number");
        }
        if self.cores < 0.0 {
            return Err("cores must not be negative");
        }
        if self.threads < 0 {
            return Err("threads must not be negative");
        }
        if self.memory_mb < 0 {
            return Err("memory must not be negative");
        }
        Ok(())
    }
}

impl Add for GridServerResource {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cores: self.cores + rhs.cores,
            threads: self.threads.saturating_add(rhs.threads),
            memory_mb: self.memory_mb.saturating_add(rhs.memory_mb),
        }
    }
}

impl AddAssign for GridServerResource {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for GridServerResource {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cores: self.cores - rhs.cores,
            threads: self.threads.saturating_sub(rhs.threads),
            memory_mb: self.memory_mb.saturating_sub(rhs.memory_mb),
        }
    }
}

impl SubAssign for GridServerResource {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for GridServerResource {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, r| acc + r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_arithmetic() {
        let a = GridServerResource::new(1.5, 4, 512);
        let b = GridServerResource::new(0.5, 2, 256);

        assert_eq!(a + b, GridServerResource::new(2.0, 6, 768));
        assert_eq!(a - b, GridServerResource::new(1.0, 2, 256));
        assert!((a - a).is_zero());
    }

    #[test]
    fn test_resource_sum() {
        let total: GridServerResource = vec![
            GridServerResource::new(1.0, 1, 100),
            GridServerResource::new(0.25, 3, 50),
        ]
        .into_iter()
        .sum();

        assert_eq!(total, GridServerResource::new(1.25, 4, 150));
    }

    #[test]
    fn test_validate_rejects_negative_and_non_finite() {
        assert!(GridServerResource::zero().validate().is_ok());
        assert!(GridServerResource::new(4.0, i64::MAX, i64::MAX).validate().is_ok());

        assert!(GridServerResource::new(-4.0, 0, 0).validate().is_err());
        assert!(GridServerResource::new(f64::NAN, 0, 0).validate().is_err());
        assert!(GridServerResource::new(f64::INFINITY, 0, 0).validate().is_err());
        assert!(GridServerResource::new(1.0, -1, 0).validate().is_err());
        assert!(GridServerResource::new(1.0, 1, -512).validate().is_err());
    }

    #[test]
    fn test_integer_components_saturate() {
        let huge = GridServerResource::new(0.0, i64::MAX, i64::MAX);
        let sum = huge + GridServerResource::new(0.0, 1, 1);

        assert_eq!(sum.threads, i64::MAX);
        assert_eq!(sum.memory_mb, i64::MAX);
    }
}
