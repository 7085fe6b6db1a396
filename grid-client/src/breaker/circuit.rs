//! Threshold circuit breaker
//!
//! State lives entirely in atomics:
//! - `failure_count` counts trip-worthy failures since the last reset
//! - `tripped` / `tripped_at_ms` record the open state
//! - `next_retry_ms` is the earliest time a probe may be admitted
//! - `should_retry` is the single probe slot, taken with a compare-and-swap

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::breaker::clock::{Clock, SystemClock};
use crate::error::{ClientError, Result};

const PROBE_AVAILABLE: u32 = 1;
const PROBE_TAKEN: u32 = 0;

/// Tuning for a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerSettings {
    /// The breaker trips once the failure count exceeds this value
    pub failures_allowed_before_trip: u32,
    /// Delay between probes while open
    pub retry_interval: Duration,
    /// When set, failures older than this window stop counting
    pub failure_window: Option<Duration>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failures_allowed_before_trip: 1,
            retry_interval: Duration::from_secs(10),
            failure_window: None,
        }
    }
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker is closed
    Closed,
    /// Breaker is open and this caller holds the single probe slot
    Probe,
}

/// Circuit breaker for one logical target
pub struct CircuitBreaker {
    name: String,
    settings: CircuitBreakerSettings,
    clock: Arc<dyn Clock>,
    failure_count: AtomicU32,
    failure_window_end_ms: AtomicU64,
    tripped: AtomicBool,
    tripped_at_ms: AtomicU64,
    next_retry_ms: AtomicU64,
    should_retry: AtomicU32,
}

impl CircuitBreaker {
    /// Creates a new breaker on the system clock
    pub fn new(name: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self::with_clock(name, settings, Arc::new(SystemClock))
    }

    /// Creates a new breaker on the given clock
    pub fn with_clock(
        name: impl Into<String>,
        settings: CircuitBreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            failure_count: AtomicU32::new(0),
            failure_window_end_ms: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
            tripped_at_ms: AtomicU64::new(0),
            next_retry_ms: AtomicU64::new(0),
            should_retry: AtomicU32::new(PROBE_AVAILABLE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &CircuitBreakerSettings {
        &self.settings
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// When the breaker opened, in clock milliseconds
    pub fn tripped_at_ms(&self) -> Option<u64> {
        if !self.is_tripped() {
            return None;
        }
        Some(self.tripped_at_ms.load(Ordering::Acquire))
    }

    /// Earliest time a probe may be admitted, while open
    pub fn next_retry_ms(&self) -> Option<u64> {
        if !self.is_tripped() {
            return None;
        }
        Some(self.next_retry_ms.load(Ordering::Acquire))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Decides whether a call may proceed
    ///
    /// While open, at most one caller per retry interval is admitted as a
    /// probe; everyone else gets `CircuitBreakerOpen` without running the call.
    pub fn test(&self) -> Result<Admission> {
        if !self.is_tripped() {
            return Ok(Admission::Closed);
        }

        let now = self.clock.now_ms();
        if now >= self.next_retry_ms.load(Ordering::Acquire)
            && self
                .should_retry
                .compare_exchange(
                    PROBE_AVAILABLE,
                    PROBE_TAKEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            return Ok(Admission::Probe);
        }

        Err(ClientError::CircuitBreakerOpen {
            name: self.name.clone(),
        })
    }

    /// Counts one trip-worthy failure
    ///
    /// # Returns
    /// True when the breaker is open after this failure
    pub fn record_failure(&self) -> bool {
        let now = self.clock.now_ms();

        if let Some(window) = self.settings.failure_window {
            let end = self.failure_window_end_ms.load(Ordering::Acquire);
            if end < now
                && self
                    .failure_window_end_ms
                    .compare_exchange(
                        end,
                        now + window.as_millis() as u64,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.failure_count.store(0, Ordering::Release);
            }
        }

        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.settings.failures_allowed_before_trip {
            self.trip();
            return true;
        }

        false
    }

    /// Opens the breaker and schedules the next probe
    ///
    /// Also used after a failed probe: the probe slot is handed back and the
    /// retry time moves forward by one interval.
    pub fn trip(&self) {
        let now = self.clock.now_ms();

        self.next_retry_ms.store(
            now + self.settings.retry_interval.as_millis() as u64,
            Ordering::Release,
        );
        self.should_retry.store(PROBE_AVAILABLE, Ordering::Release);

        if !self.tripped.swap(true, Ordering::AcqRel) {
            self.tripped_at_ms.store(now, Ordering::Release);
            tracing::warn!(
                "Circuit breaker '{}' tripped after {} failure(s)",
                self.name,
                self.failure_count()
            );
        }
    }

    /// Closes the breaker and clears the failure count
    pub fn reset(&self) {
        if !self.is_tripped() && self.failure_count() == 0 {
            return;
        }

        let was_tripped = self.tripped.swap(false, Ordering::AcqRel);
        self.failure_count.store(0, Ordering::Release);
        self.tripped_at_ms.store(0, Ordering::Release);
        self.next_retry_ms.store(0, Ordering::Release);
        self.should_retry.store(PROBE_AVAILABLE, Ordering::Release);

        if was_tripped {
            tracing::info!("Circuit breaker '{}' reset", self.name);
        }
    }

    /// Hands the probe slot back without changing the retry schedule
    pub fn release_probe(&self) {
        if self.is_tripped() {
            self.should_retry.store(PROBE_AVAILABLE, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("tripped", &self.is_tripped())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::clock::ManualClock;
    use std::sync::Barrier;

    fn breaker(threshold: u32, clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            "test",
            CircuitBreakerSettings {
                failures_allowed_before_trip: threshold,
                retry_interval: Duration::from_secs(10),
                failure_window: None,
            },
            clock,
        )
    }

    #[test]
    fn test_trips_after_threshold_exceeded() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(2, clock);

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.test().unwrap(), Admission::Closed);

        assert!(breaker.record_failure());
        assert!(breaker.is_tripped());
        assert!(breaker.test().unwrap_err().is_circuit_breaker_open());
    }

    #[test]
    fn test_probe_after_retry_interval() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(0, clock.clone());

        breaker.record_failure();
        assert!(breaker.test().is_err());

        clock.advance(Duration::from_secs(9));
        assert!(breaker.test().is_err());

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.test().unwrap(), Admission::Probe);
        // Slot already taken
        assert!(breaker.test().is_err());
    }

    #[test]
    fn test_failed_probe_reschedules() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(0, clock.clone());

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.test().unwrap(), Admission::Probe);

        breaker.record_failure();
        assert!(breaker.test().is_err());

        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.test().unwrap(), Admission::Probe);
    }

    #[test]
    fn test_successful_probe_resets() {
        let clock = Arc::new(ManualClock::default());
        let breaker = breaker(1, clock.clone());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_tripped());

        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.test().unwrap(), Admission::Probe);
        breaker.reset();

        assert!(!breaker.is_tripped());
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.tripped_at_ms(), None);
        assert_eq!(breaker.test().unwrap(), Admission::Closed);
    }

    #[test]
    fn test_single_probe_under_contention() {
        let clock = Arc::new(ManualClock::default());
        let breaker = Arc::new(breaker(0, clock.clone()));

        breaker.record_failure();
        clock.advance(Duration::from_secs(11));

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let breaker = breaker.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    breaker.test().is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_failure_window_forgets_old_failures() {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::with_clock(
            "windowed",
            CircuitBreakerSettings {
                failures_allowed_before_trip: 1,
                retry_interval: Duration::from_secs(10),
                failure_window: Some(Duration::from_secs(5)),
            },
            clock.clone(),
        );

        breaker.record_failure();
        clock.advance(Duration::from_secs(6));
        assert!(!breaker.record_failure());
        assert_eq!(breaker.failure_count(), 1);

        assert!(breaker.record_failure());
    }
}
