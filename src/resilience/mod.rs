/// Resilience module
///
/// Failure isolation for calls to collaborating services.

mod breaker;
mod client;

pub use breaker::{BreakerState, CircuitBreaker, Permit, Rejected};
pub use client::{Classify, ResilientClient};
