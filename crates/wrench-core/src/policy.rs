//! Bundles retry, circuit breaking and rate limiting around a stage.

use crate::circuit_breaker::CircuitBreaker;
use crate::limiter::RateLimiter;
use crate::retry::{RetryOpts, retry_stage};
use crate::stage::Stage;

/// The guards applied to calls against one downstream dependency.
///
/// [`wrap`](Self::wrap) layers them as `retry(breaker(limiter_wait(stage)))`:
/// every retry attempt goes through the breaker, and every admitted call
/// waits for a rate-limit token. A breaker rejection is retried like any other
/// failure, so the retry backoff also spaces out probes of an open circuit.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    pub retry: RetryOpts,
    pub breaker: Option<CircuitBreaker>,
    pub limiter: Option<RateLimiter>,
}

impl ResiliencePolicy {
    pub fn new(retry: RetryOpts) -> Self {
        Self {
            retry,
            breaker: None,
            limiter: None,
        }
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn wrap<In, Out>(&self, stage: Stage<In, Out>) -> Stage<In, Out>
    where
        In: Clone + Send + 'static,
        Out: Send + 'static,
    {
        let mut stage = stage;
        if let Some(limiter) = &self.limiter {
            stage = limiter.limited_wait(stage);
        }
        if let Some(breaker) = &self.breaker {
            stage = breaker.protect(stage);
        }
        retry_stage(self.retry, stage)
    }
}

impl Default for ResiliencePolicy {
    fn default() -> Self {
        Self::new(RetryOpts::default())
    }
}
