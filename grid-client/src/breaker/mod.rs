//! Circuit breaking
//!
//! - `CircuitBreaker`: lock-free trip/probe/reset state machine
//! - `CircuitBreakerPolicy`: a breaker plus the authority that decides which
//!   failures count toward tripping
//! - `GuardedRpc`: a `GridServerRpc` whose every call goes through a policy

mod circuit;
mod clock;
mod guarded;
mod policy;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerSettings};
pub use clock::{Clock, ManualClock, SystemClock};
pub use guarded::GuardedRpc;
pub use policy::{
    CircuitBreakerPolicy, DefaultTripReasonAuthority, ProbeGuard, RequestOutcome,
    TripReasonAuthority,
};
