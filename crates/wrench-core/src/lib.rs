pub mod circuit_breaker;
pub mod discovery;
pub mod download;
pub mod error;
pub mod limiter;
pub mod manual;
pub mod parallel;
pub mod policy;
pub mod registry;
pub mod result;
pub mod retry;
pub mod seq;
pub mod stage;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use download::{DownloadConfig, DownloadOrchestrator, DownloadReport};
pub use error::AppError;
pub use limiter::{RateLimiter, RateLimiterConfig};
pub use manual::{FetchedManual, ManualEntry, ManualStats, ManualStatus};
pub use policy::ResiliencePolicy;
pub use registry::MemoryRegistry;
pub use result::ResultExt;
pub use retry::RetryOpts;
pub use stage::Stage;
pub use traits::{ManualFetcher, ManualRegistry, ManualSource};
