use std::future::Future;
use std::time::Duration;

use crate::configuration::CircuitBreakerSettings;
use crate::error::ExternalError;
use crate::resilience::breaker::{BreakerState, CircuitBreaker};

/// How a collaborator error is judged by the breaker.
pub trait Classify: Sized {
    /// `true` for connectivity/infrastructure failures. Well-formed
    /// application answers must return `false`.
    fn counts_as_failure(&self) -> bool;

    /// Error returned without calling out while the breaker is open.
    fn circuit_open(service: &str) -> Self;

    fn timed_out(service: &str) -> Self;
}

impl Classify for ExternalError {
    fn counts_as_failure(&self) -> bool {
        self.is_infrastructure()
    }

    fn circuit_open(service: &str) -> Self {
        ExternalError::ServiceUnavailable(service.to_string())
    }

    fn timed_out(service: &str) -> Self {
        ExternalError::Timeout(service.to_string())
    }
}

/// Wraps every outbound call to one collaborator with a per-call timeout and
/// a circuit breaker.
pub struct ResilientClient {
    service: String,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl ResilientClient {
    pub fn new(service: impl Into<String>, settings: &CircuitBreakerSettings, timeout: Duration) -> Self {
        let service = service.into();
        Self {
            breaker: CircuitBreaker::new(service.clone(), settings),
            service,
            timeout,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Run `call` through the breaker. An open breaker answers immediately
    /// with [`Classify::circuit_open`]; exceeding the timeout counts as an
    /// infrastructure failure.
    pub async fn call<T, E, F, Fut>(&self, call: F) -> Result<T, E>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                tracing::warn!(
                    service = %self.service,
                    state = ?rejected.0,
                    "Call short-circuited by breaker"
                );
                return Err(E::circuit_open(&self.service));
            }
        };

        let outcome = match tokio::time::timeout(self.timeout, call()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(E::timed_out(&self.service)),
        };

        match &outcome {
            Err(e) if e.counts_as_failure() => permit.failure(),
            _ => permit.success(),
        }
        outcome
    }
}
