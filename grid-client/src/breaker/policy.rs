//! Circuit breaker policy
//!
//! Couples a `CircuitBreaker` with a `TripReasonAuthority`. Validation and
//! script errors mean the target answered, so they close the breaker instead
//! of counting toward a trip. Errors raised before the target was reached
//! (cancellation, an empty plan, a malformed request) leave it untouched.

use std::future::Future;
use std::sync::Arc;

use crate::breaker::circuit::{Admission, CircuitBreaker, CircuitBreakerSettings};
use crate::breaker::clock::Clock;
use crate::error::{ClientError, Result};

/// How a guarded request ended
#[derive(Debug, Clone, Copy)]
pub enum RequestOutcome<'a> {
    Success,
    /// A response arrived with this HTTP status
    Status(u16),
    Failed(&'a ClientError),
}

/// Decides which failures count toward tripping a breaker
pub trait TripReasonAuthority: Send + Sync {
    fn is_reason_for_trip(&self, error: &ClientError) -> bool;

    fn is_status_for_trip(&self, status: u16) -> bool {
        matches!(status, 502..=504)
    }
}

/// Trips on connectivity failures, timeouts and gateway/availability statuses
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTripReasonAuthority;

impl TripReasonAuthority for DefaultTripReasonAuthority {
    fn is_reason_for_trip(&self, error: &ClientError) -> bool {
        match error {
            ClientError::RequestFailed(e) => !e.is_builder() && !e.is_decode(),
            ClientError::Timeout(_) => true,
            ClientError::ApiError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Breaker plus trip authority for one target
pub struct CircuitBreakerPolicy {
    breaker: CircuitBreaker,
    authority: Arc<dyn TripReasonAuthority>,
}

impl CircuitBreakerPolicy {
    /// Creates a policy using the default trip authority
    pub fn new(name: impl Into<String>, settings: CircuitBreakerSettings) -> Self {
        Self::from_breaker(
            CircuitBreaker::new(name, settings),
            Arc::new(DefaultTripReasonAuthority),
        )
    }

    /// Creates a policy on a specific clock, mostly for tests
    pub fn with_clock(
        name: impl Into<String>,
        settings: CircuitBreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::from_breaker(
            CircuitBreaker::with_clock(name, settings, clock),
            Arc::new(DefaultTripReasonAuthority),
        )
    }

    pub fn from_breaker(breaker: CircuitBreaker, authority: Arc<dyn TripReasonAuthority>) -> Self {
        Self { breaker, authority }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    /// Fails fast when the breaker is open and no probe is due
    pub fn check(&self) -> Result<Admission> {
        self.breaker.test()
    }

    /// Admits a call, holding the probe slot until the guard is disarmed
    ///
    /// Dropping the guard while armed hands the slot back.
    pub fn admit(&self) -> Result<ProbeGuard<'_>> {
        let admission = self.check()?;
        Ok(ProbeGuard {
            breaker: &self.breaker,
            armed: admission == Admission::Probe,
        })
    }

    /// Feeds the outcome of an admitted request back into the breaker
    pub fn notify_request_finished(&self, outcome: RequestOutcome<'_>) {
        if let RequestOutcome::Failed(error) = outcome {
            if is_neutral(error) {
                self.breaker.release_probe();
                return;
            }
        }

        let counts = match outcome {
            RequestOutcome::Success => false,
            RequestOutcome::Status(status) => self.authority.is_status_for_trip(status),
            RequestOutcome::Failed(error) => self.authority.is_reason_for_trip(error),
        };

        if counts {
            self.breaker.record_failure();
        } else {
            self.breaker.reset();
        }
    }

    /// Runs `action` under the breaker
    ///
    /// If the returned future is dropped while holding the probe slot, the
    /// slot is released so the next caller can probe.
    pub async fn execute<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.admit()?;

        let result = action().await;
        guard.disarm();

        match &result {
            Ok(_) => self.notify_request_finished(RequestOutcome::Success),
            Err(e) => self.notify_request_finished(RequestOutcome::Failed(e)),
        }

        result
    }
}

impl std::fmt::Debug for CircuitBreakerPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerPolicy")
            .field("breaker", &self.breaker)
            .finish()
    }
}

/// Says nothing about the target's health
fn is_neutral(error: &ClientError) -> bool {
    matches!(
        error,
        ClientError::Cancelled
            | ClientError::NoHandlers
            | ClientError::InvalidRequest(_)
            | ClientError::InternalError(_)
            | ClientError::CircuitBreakerOpen { .. }
    )
}

/// Probe slot held by an admitted call
pub struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    /// Whether this call was admitted as the half-open probe
    pub fn is_probe(&self) -> bool {
        self.armed
    }

    /// Keeps the slot taken; the outcome decides what happens next
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}
