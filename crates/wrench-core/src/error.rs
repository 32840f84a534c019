use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Wrench.
#[derive(Error, Debug)]
pub enum AppError {
    /// The token bucket refused admission. The wrapped operation was not called.
    #[error("rate limited")]
    RateLimited,

    /// The circuit breaker refused admission. The wrapped operation was not called.
    #[error("circuit breaker '{name}' is open, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { name: String, retry_after: Duration },

    /// The ambient cancellation token fired.
    ///
    /// `last_error` carries the most recent operation failure observed before
    /// cancellation, when there was one.
    #[error("operation cancelled{}", .last_error.as_ref().map(|e| format!(" (last error: {e})")).unwrap_or_default())]
    Cancelled { last_error: Option<Box<AppError>> },

    /// Request timed out.
    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    /// HTTP request failed or returned an unexpected status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Local file system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fetched artifact is not what it claims to be (e.g. not a PDF).
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// No registered manual has the given id.
    #[error("manual not found: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn generic(message: impl Into<String>) -> Self {
        AppError::Generic(message.into())
    }

    /// Cancellation with no prior operation failure.
    pub fn cancelled() -> Self {
        AppError::Cancelled { last_error: None }
    }

    /// Returns true if the ambient context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled { .. })
    }

    /// Returns true if a guard refused to call the operation at all.
    pub fn is_refusal(&self) -> bool {
        matches!(self, AppError::RateLimited | AppError::CircuitOpen { .. })
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimited
            | AppError::CircuitOpen { .. } => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 5")
                    || msg.contains("HTTP 429")
            }
            _ => false,
        }
    }
}

/// Build an [`AppError::Generic`] from format arguments and return it as `Err`.
///
/// ```
/// use wrench_core::{AppError, fail};
///
/// fn check(n: u32) -> Result<u32, AppError> {
///     if n == 0 {
///         return fail!("expected a positive value, got {n}");
///     }
///     Ok(n)
/// }
/// assert!(check(0).is_err());
/// ```
#[macro_export]
macro_rules! fail {
    ($($arg:tt)*) => {
        Err($crate::error::AppError::Generic(format!($($arg)*)))
    };
}
