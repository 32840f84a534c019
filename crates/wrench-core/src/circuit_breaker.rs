//! Circuit breaker for protecting a single downstream dependency.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[timeout]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```
//!
//! The Open → HalfOpen transition is lazy: it happens on the next access
//! after `open_timeout`, under the same lock as the admission decision, so
//! two callers can never both take the last probe slot.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::stage::Stage;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
///
/// Zero values fall back to the defaults (5 failures, 30s, 1 probe).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub open_timeout: Duration,

    /// Number of probe calls admitted while Half-Open.
    pub half_open_max: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_max: 1,
        }
    }
}

impl CircuitBreakerConfig {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: if self.failure_threshold == 0 {
                defaults.failure_threshold
            } else {
                self.failure_threshold
            },
            open_timeout: if self.open_timeout.is_zero() {
                defaults.open_timeout
            } else {
                self.open_timeout
            },
            half_open_max: if self.half_open_max == 0 {
                defaults.half_open_max
            } else {
                self.half_open_max
            },
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_issued: u32,
    last_error_message: Option<String>,
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_issued: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker. Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Admission outcome, decided under the lock.
enum Admission {
    Admitted { probe: bool },
    Rejected { retry_after: Duration },
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: config.normalized(),
            inner: Arc::new(Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_issued: 0,
                last_error_message: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open = match inner.state {
            CircuitState::Open => Some(self.remaining_open(&inner)),
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_issued: inner.half_open_issued,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns [`AppError::CircuitOpen`] immediately
    /// - HalfOpen: executes operation if a probe slot is free, else rejects
    ///
    /// The operation runs without the lock held. A [`AppError::Cancelled`]
    /// outcome is neither a success nor a failure; it only gives back the
    /// probe slot it held. While Half-Open only probe outcomes move the
    /// circuit; a call admitted earlier while Closed that finishes late is
    /// ignored.
    pub async fn call<T, F, Fut>(&self, cancel: &CancellationToken, operation: F) -> Result<T, AppError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let probe = match self.admit() {
            Admission::Admitted { probe } => probe,
            Admission::Rejected { retry_after } => {
                tracing::debug!(circuit = %self.name, retry_after_ms = %retry_after.as_millis(), "Circuit open, call rejected");
                return Err(AppError::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        };

        let result = operation(cancel.clone()).await;

        match &result {
            Ok(_) => self.record_success(probe),
            Err(e) if e.is_cancelled() => self.release_probe(probe),
            Err(e) => self.record_failure(e, probe),
        }
        result
    }

    /// Wraps a stage so every invocation goes through [`call`](Self::call).
    pub fn protect<In, Out>(&self, stage: Stage<In, Out>) -> Stage<In, Out>
    where
        In: Send + 'static,
        Out: Send + 'static,
    {
        let breaker = self.clone();
        Stage::new(move |cancel: CancellationToken, input: In| {
            let breaker = breaker.clone();
            let stage = stage.clone();
            async move {
                breaker
                    .call(&cancel, move |token| stage.run(token, input))
                    .await
            }
        })
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.half_open_issued = 0;
        inner.last_error_message = None;
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Admission::Admitted { probe: false },
            CircuitState::Open => Admission::Rejected {
                retry_after: self.remaining_open(&inner),
            },
            CircuitState::HalfOpen if inner.half_open_issued >= self.config.half_open_max => {
                Admission::Rejected {
                    retry_after: Duration::ZERO,
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_issued += 1;
                Admission::Admitted { probe: true }
            }
        }
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            if !probe {
                return;
            }
            tracing::info!(circuit = %self.name, "Circuit breaker closing after successful probe");
            inner.state = CircuitState::Closed;
            inner.half_open_issued = 0;
            inner.last_error_message = None;
        }
        inner.consecutive_failures = 0;
    }

    fn record_failure(&self, error: &AppError, probe: bool) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen && !probe {
            return;
        }
        inner.consecutive_failures += 1;
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                self.open(&mut inner);
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    circuit = %self.name,
                    failures = inner.consecutive_failures,
                    error = %error,
                    "Circuit breaker opening after {} consecutive failures",
                    inner.consecutive_failures
                );
                self.open(&mut inner);
            }
            // A call admitted while closed can finish after the circuit opened.
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn release_probe(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_issued = inner.half_open_issued.saturating_sub(1);
        }
    }

    fn open(&self, inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.half_open_issued = 0;
    }

    fn remaining_open(&self, inner: &CircuitBreakerInner) -> Duration {
        inner
            .opened_at
            .map(|t| self.config.open_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.config.open_timeout)
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.open_timeout
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.half_open_issued = 0;
        }
    }
}
