//! # Stanchion
//!
//! Reliability primitives for Rust services: structured error taxonomy,
//! retry with backoff, circuit breakers, and connection pooling.
//!
//! ## Features
//!
//! - **Error Taxonomy**: closed category/severity enums and structured
//!   reports, so policy code matches on categories instead of types
//! - **Retry with Backoff**: exponential, linear, constant, fibonacci, and
//!   decorrelated strategies, with deadlines and shared retry budgets
//! - **Circuit Breaker**: three-state machine over a sliding window of call
//!   outcomes, with failure-rate and slow-call-rate trip conditions
//! - **Connection Pooling**: generic, health-checked, recyclable, with
//!   overflow connections and RAII release
//! - **Registries**: named get-or-create maps so every call site naming the
//!   same dependency shares one breaker or pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stanchion::{Error, RetryConfig, RetryManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = RetryManager::new();
//!     let config = RetryConfig::exponential(3, Duration::from_millis(100));
//!
//!     let outcome = manager.retry(&config, || async {
//!         Err::<(), _>(Error::network("connection refused"))
//!     }).await;
//!
//!     println!("succeeded={} attempts={}", outcome.succeeded, outcome.attempts.len());
//! }
//! ```
//!
//! ## With a Circuit Breaker
//!
//! ```rust,no_run
//! use stanchion::{CircuitBreaker, CircuitBreakerConfig, Error};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = CircuitBreaker::new(
//!         "billing-api",
//!         CircuitBreakerConfig::new()
//!             .failure_threshold(5)
//!             .reset_timeout(Duration::from_secs(30)),
//!     );
//!
//!     let result = breaker.call(|| async {
//!         Ok::<_, Error>("charged")
//!     }).await;
//!
//!     // Rejections carry the breaker name and state; execution errors
//!     // propagate unchanged.
//!     let _ = result;
//! }
//! ```

mod circuit_breaker;
mod error;
mod pool;
mod registry;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStatus, CircuitState,
};
pub use error::{
    Error, ErrorCategory, ErrorContext, ErrorLog, ErrorLogSummary, ErrorReport, ErrorSeverity,
    Result,
};
pub use pool::{
    ConnectionFactory, ConnectionPool, PoolConfig, PoolError, PoolStats, PooledConnection,
};
pub use registry::{CircuitBreakerRegistry, PoolRegistry};
pub use retry::{
    BudgetUsage, RetryAttempt, RetryBudget, RetryConfig, RetryManager, RetryMetrics, RetryResult,
    RetryStrategy,
};

/// Prelude for common imports.
///
/// ```
/// use stanchion::prelude::*;
/// ```
pub mod prelude {
    pub use crate::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    };
    pub use crate::error::{
        Error, ErrorCategory, ErrorContext, ErrorLog, ErrorReport, ErrorSeverity, Result,
    };
    pub use crate::pool::{
        ConnectionFactory, ConnectionPool, PoolConfig, PoolError, PooledConnection,
    };
    pub use crate::registry::{CircuitBreakerRegistry, PoolRegistry};
    pub use crate::retry::{RetryBudget, RetryConfig, RetryManager, RetryResult, RetryStrategy};
}
