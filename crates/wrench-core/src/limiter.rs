//! Token-bucket rate limiting.
//!
//! The bucket holds up to `burst` tokens and refills continuously at `rate`
//! tokens per second. Every admitted call spends exactly one token.
//!
//! ```text
//! tokens = min(burst, tokens + elapsed_secs * rate)
//! ```
//!
//! One limiter guards one logical resource (a host, an API key). Clone the
//! handle to share it; clones draw from the same bucket.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::stage::Stage;

/// Shortest sleep between admission checks in [`RateLimiter::wait`].
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Longest single sleep in [`RateLimiter::wait`]; very low rates are re-checked
/// at least this often.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Configuration for a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens added per second. Must be finite and greater than zero.
    pub rate: f64,
    /// Bucket capacity. `0` is treated as `1`.
    pub burst: u32,
}

impl RateLimiterConfig {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    /// One token every `interval`, no burst.
    pub fn every(interval: Duration) -> Self {
        Self {
            rate: 1.0 / interval.as_secs_f64(),
            burst: 1,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { rate: 1.0, burst: 1 }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Thread-safe token bucket. The bucket starts full.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    name: String,
    rate: f64,
    burst: f64,
    inner: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, AppError> {
        let name = name.into();
        if !config.rate.is_finite() || config.rate <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "rate limiter '{name}': rate must be a positive number of tokens per second, got {}",
                config.rate
            )));
        }
        let burst = f64::from(config.burst.max(1));
        Ok(Self {
            name,
            rate: config.rate,
            burst,
            inner: Arc::new(Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            })),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(limiter = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Takes a token if one is available. Never blocks.
    pub fn allow(&self) -> bool {
        let mut bucket = self.lock_inner();
        bucket.refill(self.rate, self.burst);
        bucket.try_take()
    }

    /// Tokens currently in the bucket, after refilling.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.lock_inner();
        bucket.refill(self.rate, self.burst);
        bucket.tokens
    }

    /// Waits until a token can be taken, or returns [`AppError::Cancelled`]
    /// if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        loop {
            let wait = {
                let mut bucket = self.lock_inner();
                bucket.refill(self.rate, self.burst);
                if bucket.try_take() {
                    return Ok(());
                }
                let deficit = 1.0 - bucket.tokens;
                Duration::try_from_secs_f64(deficit / self.rate)
                    .unwrap_or(MAX_WAIT)
                    .clamp(MIN_WAIT, MAX_WAIT)
            };

            tracing::trace!(limiter = %self.name, wait_ms = %wait.as_millis(), "Waiting for token");
            tokio::select! {
                () = cancel.cancelled() => return Err(AppError::cancelled()),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Runs `op` if a token is available, otherwise returns
    /// [`AppError::RateLimited`] without calling it.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, op: F) -> Result<T, AppError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        if !self.allow() {
            tracing::debug!(limiter = %self.name, "Rate limited");
            return Err(AppError::RateLimited);
        }
        op(cancel.clone()).await
    }

    /// Waits for a token, then runs `op`.
    pub async fn call_wait<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.wait(cancel).await?;
        op(cancel.clone()).await
    }

    /// Gates a stage behind [`allow`](Self::allow).
    pub fn limited<In, Out>(&self, stage: Stage<In, Out>) -> Stage<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let limiter = self.clone();
        Stage::new(move |cancel: CancellationToken, input: In| {
            let limiter = limiter.clone();
            let stage = stage.clone();
            async move {
                limiter
                    .call(&cancel, move |token| stage.run(token, input))
                    .await
            }
        })
    }

    /// Gates a stage behind [`wait`](Self::wait).
    pub fn limited_wait<In, Out>(&self, stage: Stage<In, Out>) -> Stage<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let limiter = self.clone();
        Stage::new(move |cancel: CancellationToken, input: In| {
            let limiter = limiter.clone();
            let stage = stage.clone();
            async move {
                limiter
                    .call_wait(&cancel, move |token| stage.run(token, input))
                    .await
            }
        })
    }
}
