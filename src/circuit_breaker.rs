//! Circuit breaker pattern implementation.
//!
//! The circuit breaker prevents cascade failures by monitoring call outcomes
//! and "opening" to reject requests once a failure threshold is reached.
//!
//! ## States
//!
//! - **Closed**: normal operation, calls pass through and are classified
//! - **Open**: calls fail fast without invoking the wrapped operation
//! - **Half-Open**: a limited number of trial calls probe for recovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanchion::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "billing-api",
//!     CircuitBreakerConfig::new()
//!         .failure_threshold(5)
//!         .reset_timeout(Duration::from_secs(30)),
//! );
//!
//! let result = breaker.call(|| async {
//!     billing.charge(&invoice).await
//! }).await;
//!
//! match result {
//!     Ok(receipt) => handle(receipt),
//!     Err(CircuitBreakerError::Open { .. }) => serve_degraded(),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use crate::error::{Error, ErrorCategory};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The window never retains more than this many call records.
const MAX_WINDOW_RECORDS: usize = 1000;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is half-open, testing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures in the window before the circuit opens.
    pub failure_threshold: u32,
    /// Successful trials needed to close the circuit from half-open.
    pub success_threshold: u32,
    /// Time to wait in open state before probing recovery.
    pub reset_timeout: Duration,
    /// Rolling window over which call outcomes are counted.
    pub window_size: Duration,
    /// Trial calls allowed while half-open.
    pub half_open_max_calls: u32,
    /// Error categories that count against the breaker; everything else
    /// propagates without touching breaker state.
    pub expected_categories: Vec<ErrorCategory>,
    /// Open when the windowed failure rate reaches this fraction.
    pub failure_rate_threshold: Option<f64>,
    /// Calls at least this long count as slow.
    pub slow_call_duration: Option<Duration>,
    /// Open when the windowed slow-call rate reaches this fraction.
    pub slow_call_rate_threshold: Option<f64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            window_size: Duration::from_secs(60),
            half_open_max_calls: 3,
            expected_categories: vec![
                ErrorCategory::Network,
                ErrorCategory::Api,
                ErrorCategory::Database,
            ],
            failure_rate_threshold: None,
            slow_call_duration: None,
            slow_call_rate_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for recovery.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open-state reset timeout.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the rolling metrics window.
    pub fn window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    /// Set the number of half-open trial calls allowed.
    pub fn half_open_max_calls(mut self, count: u32) -> Self {
        self.half_open_max_calls = count;
        self
    }

    /// Set the error categories that count against the breaker.
    pub fn expected_categories(mut self, categories: Vec<ErrorCategory>) -> Self {
        self.expected_categories = categories;
        self
    }

    /// Open on a windowed failure rate at or above `rate` (0.0 - 1.0).
    pub fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = Some(rate);
        self
    }

    /// Open on a windowed slow-call rate at or above `rate`, where a call is
    /// slow once it takes at least `duration`.
    pub fn slow_call_threshold(mut self, duration: Duration, rate: f64) -> Self {
        self.slow_call_duration = Some(duration);
        self.slow_call_rate_threshold = Some(rate);
        self
    }
}

/// Circuit breaker error.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    /// Circuit is open; the operation was not invoked.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Name of the rejecting breaker.
        name: String,
        /// When the breaker last saw a failure.
        last_failure: Option<DateTime<Utc>>,
    },

    /// Circuit is half-open and its trial allowance is used up.
    #[error("circuit breaker '{name}' is half-open, trial limit reached")]
    HalfOpenLimitReached {
        /// Name of the rejecting breaker.
        name: String,
    },

    /// The operation was invoked and failed.
    #[error(transparent)]
    Execution(#[from] Error),
}

impl CircuitBreakerError {
    /// Whether the breaker rejected the call without invoking the operation.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::HalfOpenLimitReached { .. })
    }
}

impl From<CircuitBreakerError> for Error {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Execution(inner) => inner,
            rejection => Error::unknown(rejection.to_string())
                .with_suggestion("Wait for circuit to recover")
                .with_suggestion("Check service health")
                .with_suggestion("Use fallback mechanism if available"),
        }
    }
}

/// Outcome of a single wrapped call, held in the rolling window.
#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    duration: Duration,
    succeeded: bool,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_calls: u32,
    window: VecDeque<CallRecord>,
    last_failure_instant: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failure counter (with success decay) in closed state.
    pub failure_count: u32,
    /// Success counter in half-open state.
    pub success_count: u32,
    /// Trials consumed in half-open state.
    pub half_open_calls: u32,
    /// Total calls admitted to preflight.
    pub total_calls: u64,
    /// Total recorded failures.
    pub total_failures: u64,
    /// Total recorded successes.
    pub total_successes: u64,
    /// Times the circuit opened.
    pub circuit_opens: u64,
    /// Times a fallback was invoked.
    pub fallback_calls: u64,
    /// Calls rejected while open or half-open-exhausted.
    pub rejected_calls: u64,
    /// Failure fraction over the live window.
    pub failure_rate: f64,
    /// Slow-call fraction over the live window.
    pub slow_call_rate: f64,
    /// When the breaker last saw a failure.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When the breaker last saw a success.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Records currently in the window.
    pub window_len: usize,
}

/// Three-state circuit breaker driven by a sliding window of call outcomes.
///
/// Bookkeeping is serialized by an internal lock; the wrapped operation
/// itself always executes outside that lock. The async and blocking entry
/// points share one preflight/settle pair, so their semantics are identical.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    circuit_opens: AtomicU64,
    fallback_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a named circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Arc<Self> {
        let name = name.into();
        info!(
            name = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout = ?config.reset_timeout,
            "Circuit breaker initialized"
        );

        Arc::new(Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_calls: 0,
                window: VecDeque::new(),
                last_failure_instant: None,
                last_failure_at: None,
                last_success_at: None,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            circuit_opens: AtomicU64::new(0),
            fallback_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        })
    }

    /// The breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any due open-to-half-open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    /// Execute an async operation through the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        self.preflight()?;

        let started = Instant::now();
        match op().await {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.settle_error(&err, started.elapsed());
                Err(CircuitBreakerError::Execution(err))
            }
        }
    }

    /// Execute an async operation, running `fallback` if the breaker rejects
    /// the call.
    pub async fn call_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = crate::error::Result<T>>,
    {
        if self.preflight().is_err() {
            self.fallback_calls.fetch_add(1, Ordering::Relaxed);
            debug!(name = %self.name, "Circuit rejected call, invoking fallback");
            return fallback().await.map_err(CircuitBreakerError::Execution);
        }

        let started = Instant::now();
        match op().await {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.settle_error(&err, started.elapsed());
                Err(CircuitBreakerError::Execution(err))
            }
        }
    }

    /// Execute a blocking operation through the breaker.
    pub fn call_blocking<T, F>(&self, op: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> crate::error::Result<T>,
    {
        self.preflight()?;

        let started = Instant::now();
        match op() {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.settle_error(&err, started.elapsed());
                Err(CircuitBreakerError::Execution(err))
            }
        }
    }

    /// Execute a blocking operation, running `fallback` if the breaker
    /// rejects the call.
    pub fn call_blocking_with_fallback<T, F, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> crate::error::Result<T>,
        FB: FnOnce() -> crate::error::Result<T>,
    {
        if self.preflight().is_err() {
            self.fallback_calls.fetch_add(1, Ordering::Relaxed);
            debug!(name = %self.name, "Circuit rejected call, invoking fallback");
            return fallback().map_err(CircuitBreakerError::Execution);
        }

        let started = Instant::now();
        match op() {
            Ok(value) => {
                self.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.settle_error(&err, started.elapsed());
                Err(CircuitBreakerError::Execution(err))
            }
        }
    }

    /// Admission check run before every call. Updates state transitions and
    /// either admits the call or returns the typed rejection.
    fn preflight(&self) -> Result<(), CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.evaluate_state(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            CircuitState::Open => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                warn!(name = %self.name, "Circuit is open, failing fast");
                Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    last_failure: inner.last_failure_at,
                })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    warn!(name = %self.name, "Circuit is half-open, trial limit reached");
                    Err(CircuitBreakerError::HalfOpenLimitReached {
                        name: self.name.clone(),
                    })
                } else {
                    inner.half_open_calls += 1;
                    self.total_calls.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
            }
        }
    }

    /// Transition from open to half-open once the reset timeout elapses.
    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_instant
            && last_failure.elapsed() >= self.config.reset_timeout
        {
            info!(name = %self.name, "Circuit transitioning to half-open");
            inner.state = CircuitState::HalfOpen;
            inner.half_open_calls = 0;
            inner.success_count = 0;
            inner.failure_count = 0;
        }
    }

    /// Apply due state transitions: open-to-half-open on timeout, and the
    /// closed-state trip conditions over the pruned window.
    fn evaluate_state(&self, inner: &mut BreakerInner) {
        self.maybe_half_open(inner);

        if inner.state == CircuitState::Closed {
            Self::prune_window(&mut inner.window, self.config.window_size);

            let should_open = inner.failure_count >= self.config.failure_threshold
                || self
                    .config
                    .failure_rate_threshold
                    .is_some_and(|t| Self::failure_rate(&inner.window) >= t)
                || matches!(
                    (self.config.slow_call_duration, self.config.slow_call_rate_threshold),
                    (Some(duration), Some(t))
                        if Self::slow_call_rate(&inner.window, duration) >= t
                );

            if should_open {
                self.open_locked(inner);
            }
        }
    }

    fn open_locked(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            warn!(
                name = %self.name,
                failures = inner.failure_count,
                "Circuit breaker OPENED"
            );
            inner.state = CircuitState::Open;
            self.circuit_opens.fetch_add(1, Ordering::Relaxed);
        }
        inner.last_failure_instant = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.half_open_calls = 0;
        inner.success_count = 0;
    }

    fn close_locked(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Closed {
            info!(name = %self.name, "Circuit breaker CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.half_open_calls = 0;
        // Outcomes from before the outage would re-trip the rate checks.
        inner.window.clear();
    }

    fn record_success(&self, duration: Duration) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.last_success_at = Some(Utc::now());
        Self::push_record(&mut inner.window, duration, true, self.config.window_size);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.close_locked(&mut inner);
                }
            }
            CircuitState::Closed => {
                // Success decays the failure count instead of zeroing it.
                inner.failure_count = inner.failure_count.saturating_sub(1);
            }
            CircuitState::Open => {
                debug!(name = %self.name, "Success recorded while circuit open");
            }
        }
    }

    fn record_failure(&self, duration: Duration) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.last_failure_instant = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.failure_count += 1;
        Self::push_record(&mut inner.window, duration, false, self.config.window_size);

        if inner.state == CircuitState::HalfOpen {
            warn!(name = %self.name, "Failure during half-open trial, reopening");
            self.open_locked(&mut inner);
        }
    }

    /// Classify an execution error: expected categories feed the breaker,
    /// everything else propagates without touching its state.
    fn settle_error(&self, err: &Error, duration: Duration) {
        if self.config.expected_categories.contains(&err.category()) {
            self.record_failure(duration);
        } else {
            debug!(
                name = %self.name,
                category = %err.category(),
                "Unexpected error category, not counted by breaker"
            );
        }
    }

    fn push_record(
        window: &mut VecDeque<CallRecord>,
        duration: Duration,
        succeeded: bool,
        window_size: Duration,
    ) {
        window.push_back(CallRecord {
            at: Instant::now(),
            duration,
            succeeded,
        });
        Self::prune_window(window, window_size);
        while window.len() > MAX_WINDOW_RECORDS {
            window.pop_front();
        }
    }

    fn prune_window(window: &mut VecDeque<CallRecord>, window_size: Duration) {
        let now = Instant::now();
        while let Some(front) = window.front() {
            if now.duration_since(front.at) > window_size {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(window: &VecDeque<CallRecord>) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let failures = window.iter().filter(|r| !r.succeeded).count();
        failures as f64 / window.len() as f64
    }

    fn slow_call_rate(window: &VecDeque<CallRecord>, slow_call_duration: Duration) -> f64 {
        if window.is_empty() {
            return 0.0;
        }
        let slow = window
            .iter()
            .filter(|r| r.duration >= slow_call_duration)
            .count();
        slow as f64 / window.len() as f64
    }

    /// Force the breaker back to closed and zero every counter.
    pub fn reset(&self) {
        info!(name = %self.name, "Resetting circuit breaker");
        let mut inner = self.inner.lock();
        self.close_locked(&mut inner);
        inner.window.clear();
        inner.last_failure_instant = None;
        inner.last_failure_at = None;
        inner.last_success_at = None;
    }

    /// Manually trip the circuit open.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.open_locked(&mut inner);
    }

    /// Point-in-time status snapshot over the live window.
    pub fn status(&self) -> CircuitBreakerStatus {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        Self::prune_window(&mut inner.window, self.config.window_size);

        let slow_call_rate = self
            .config
            .slow_call_duration
            .map(|d| Self::slow_call_rate(&inner.window, d))
            .unwrap_or(0.0);

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_calls: inner.half_open_calls,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            circuit_opens: self.circuit_opens.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate: Self::failure_rate(&inner.window),
            slow_call_rate,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            window_len: inner.window.len(),
        }
    }
}
