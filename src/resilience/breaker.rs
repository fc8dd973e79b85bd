/// Circuit breaker
///
/// Closed: calls pass, failures are counted inside a rolling interval.
/// Open: calls are refused until the open timeout elapses.
/// Half-open: a bounded number of probes pass; enough successes close the
/// breaker, any failure opens it again.
///
/// Each state change starts a new generation. Outcomes reported for an
/// older generation are ignored, so a slow call that started before a
/// transition cannot corrupt the counters of the next state.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::configuration::CircuitBreakerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected(pub BreakerState);

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    requests: u32,
    failures: u32,
    consecutive_successes: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// End of the closed interval, or end of the open timeout
    expiry: Instant,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    interval: Duration,
    open_timeout: Duration,
    half_open_max_requests: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        let interval = Duration::from_secs(settings.interval_seconds);
        Self {
            name: name.into(),
            failure_threshold: settings.failure_threshold.max(1),
            interval,
            open_timeout: Duration::from_secs(settings.open_timeout_seconds),
            half_open_max_requests: settings.half_open_max_requests.max(1),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: Instant::now() + interval,
            }),
        }
    }

    /// Override the open timeout (tests use sub-second timeouts).
    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // A panic while holding the lock cannot leave the counters unusable.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Admit one call, returning a permit tied to the current generation.
    pub fn try_acquire(&self) -> Result<Permit<'_>, Rejected> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            BreakerState::Open => return Err(Rejected(BreakerState::Open)),
            BreakerState::HalfOpen if inner.counts.requests >= self.half_open_max_requests => {
                return Err(Rejected(BreakerState::HalfOpen));
            }
            _ => {}
        }

        inner.counts.requests += 1;
        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            settled: false,
        })
    }

    fn settle(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            inner.counts.consecutive_successes += 1;
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.half_open_max_requests
            {
                self.transition(&mut inner, BreakerState::Closed, now);
            }
            return;
        }

        inner.counts.failures += 1;
        inner.counts.consecutive_successes = 0;
        match inner.state {
            BreakerState::Closed if inner.counts.failures >= self.failure_threshold => {
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::HalfOpen => self.transition(&mut inner, BreakerState::Open, now),
            _ => {}
        }
    }

    /// A call abandoned before completion frees its half-open slot without
    /// counting for or against the dependency.
    fn release(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.counts.requests > 0 {
            inner.counts.requests -= 1;
        }
    }

    /// Apply time-driven transitions.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            // a zero interval keeps closed-state counts until the next transition
            BreakerState::Closed if !self.interval.is_zero() && now >= inner.expiry => {
                inner.generation += 1;
                inner.counts = Counts::default();
                inner.expiry = now + self.interval;
            }
            BreakerState::Open if now >= inner.expiry => {
                self.transition(inner, BreakerState::HalfOpen, now);
            }
            _ => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match to {
            BreakerState::Closed => now + self.interval,
            BreakerState::Open => now + self.open_timeout,
            BreakerState::HalfOpen => now,
        };

        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, ?from, "Circuit breaker opened")
            }
            _ => tracing::info!(breaker = %self.name, ?from, ?to, "Circuit breaker state changed"),
        }
    }
}

/// Admission for one call. Report the outcome with [`Permit::success`] or
/// [`Permit::failure`]; dropping it unreported releases the slot.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, false);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, probes: u32) -> CircuitBreaker {
        let settings = CircuitBreakerSettings {
            failure_threshold: threshold,
            interval_seconds: 60,
            open_timeout_seconds: 30,
            half_open_max_requests: probes,
        };
        CircuitBreaker::new("test", &settings).with_open_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_trips_after_threshold() {
        let cb = breaker(3, 1);
        for _ in 0..2 {
            cb.try_acquire().unwrap().failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire().err(), Some(Rejected(BreakerState::Open)));
    }

    #[test]
    fn test_zero_interval_never_clears_failures() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 3,
            interval_seconds: 0,
            open_timeout_seconds: 30,
            half_open_max_requests: 1,
        };
        let cb = CircuitBreaker::new("test", &settings);
        for _ in 0..2 {
            cb.try_acquire().unwrap().failure();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_successes_do_not_trip() {
        let cb = breaker(2, 1);
        for _ in 0..10 {
            cb.try_acquire().unwrap().success();
        }
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let cb = breaker(1, 1);
        cb.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        let probe = cb.try_acquire().unwrap();
        // only one probe at a time
        assert_eq!(cb.try_acquire().err(), Some(Rejected(BreakerState::HalfOpen)));
        probe.success();

        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1, 2);
        cb.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(150));

        cb.try_acquire().unwrap().success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.try_acquire().unwrap().failure();

        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_dropped_permit_frees_half_open_slot() {
        let cb = breaker(1, 1);
        cb.try_acquire().unwrap().failure();
        std::thread::sleep(Duration::from_millis(150));

        drop(cb.try_acquire().unwrap());
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_stale_outcome_is_ignored() {
        let settings = CircuitBreakerSettings {
            failure_threshold: 1,
            ..CircuitBreakerSettings::default()
        };
        let cb = CircuitBreaker::new("test", &settings);
        let slow = cb.try_acquire().unwrap();
        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), BreakerState::Open);

        // started while closed, finishes after the trip
        slow.success();
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
