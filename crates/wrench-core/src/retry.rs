//! Exponential-backoff retry with optional jitter and cooperative cancellation.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::stage::Stage;

/// Retry policy.
///
/// The un-jittered wait after attempt `n` (0-indexed) is
/// `min(max_wait, initial_wait * 2^n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryOpts {
    /// Total number of invocations, including the first. `0` is treated as `1`.
    pub max_attempts: u32,
    pub initial_wait: Duration,
    pub max_wait: Duration,
    /// Scale each wait by a uniform factor in `[0.5, 1.5)`, then re-apply the cap.
    pub jitter: bool,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryOpts {
    pub fn new(max_attempts: u32, initial_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_attempts,
            initial_wait,
            max_wait,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered wait after the given 0-indexed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_wait
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }

    /// Wait actually slept after the given attempt, jitter included.
    fn sleep_for(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter {
            return base;
        }
        let scale = rand::thread_rng().gen_range(0.5..1.5);
        base.mul_f64(scale).min(self.max_wait)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Invokes `op` until it succeeds or `opts.max_attempts` invocations have failed.
///
/// Returns the last failure once attempts are exhausted. If `cancel` fires
/// between attempts the loop stops with [`AppError::Cancelled`], carrying the
/// last operation failure in `last_error`. The interrupted attempt counts as
/// consumed.
///
/// `op` must be safe to repeat; nothing here checks that.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    opts: RetryOpts,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = opts.attempts();
    let mut attempt = 0;
    loop {
        let err = match op(cancel.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt + 1 >= attempts {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(cancelled_after(err));
        }

        let wait = opts.sleep_for(attempt);
        tracing::debug!(
            attempt = attempt + 1,
            max_attempts = attempts,
            wait_ms = %wait.as_millis(),
            error = %err,
            "Retrying after failure"
        );

        tokio::select! {
            () = cancel.cancelled() => return Err(cancelled_after(err)),
            () = tokio::time::sleep(wait) => {}
        }
        attempt += 1;
    }
}

/// Lifts [`retry`] into a stage. The same input is re-supplied on every attempt.
pub fn retry_stage<In, Out>(opts: RetryOpts, stage: Stage<In, Out>) -> Stage<In, Out>
where
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    Stage::new(move |cancel: CancellationToken, input: In| {
        let stage = stage.clone();
        async move {
            retry(&cancel, opts, move |token| stage.run(token, input.clone())).await
        }
    })
}

fn cancelled_after(err: AppError) -> AppError {
    match err {
        // Already a cancellation; don't nest it.
        e @ AppError::Cancelled { .. } => e,
        e => AppError::Cancelled {
            last_error: Some(Box::new(e)),
        },
    }
}
