//! Retry with configurable backoff strategies, deadlines, and shared budgets.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stanchion::{RetryManager, RetryConfig};
//! use std::time::Duration;
//!
//! let manager = RetryManager::new();
//! let config = RetryConfig::exponential(3, Duration::from_millis(100));
//!
//! let outcome = manager.retry(&config, || async {
//!     external_service.fetch().await
//! }).await;
//!
//! if outcome.succeeded {
//!     println!("took {} attempts", outcome.attempts.len());
//! }
//! ```

use crate::error::{Error, ErrorCategory};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Backoff strategy for spacing retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Delay grows by a configurable base per attempt.
    Exponential,
    /// Delay grows by the initial delay per attempt.
    Linear,
    /// Same delay between every attempt.
    Constant,
    /// Delay follows the Fibonacci sequence.
    Fibonacci,
    /// Each delay is drawn uniformly from (initial, 3 x previous delay).
    Decorrelated,
}

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first. `1` means no retries.
    pub max_attempts: u32,
    /// Base delay fed into the backoff strategy.
    pub initial_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Growth base for the exponential strategy.
    pub exponential_base: f64,
    /// Backoff strategy.
    pub strategy: RetryStrategy,
    /// Multiply each delay by a random factor from `jitter_range`.
    pub jitter: bool,
    /// Jitter factor range, applied to all strategies except decorrelated.
    pub jitter_range: (f64, f64),
    /// Error categories that are worth retrying.
    pub retry_on_categories: Vec<ErrorCategory>,
    /// Status codes on API errors that are worth retrying.
    pub retry_on_status_codes: Vec<u16>,
    /// Absolute time budget for all attempts together.
    pub deadline: Option<Duration>,
    /// Shared budget size; `None` disables budget tracking.
    pub retry_budget: Option<u32>,
    /// Sliding window over which the budget counts attempts.
    pub budget_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            strategy: RetryStrategy::Exponential,
            jitter: true,
            jitter_range: (0.8, 1.2),
            retry_on_categories: vec![
                ErrorCategory::Network,
                ErrorCategory::Api,
                ErrorCategory::Database,
            ],
            retry_on_status_codes: vec![408, 429, 500, 501, 502, 503, 504],
            deadline: None,
            retry_budget: None,
            budget_window: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff configuration.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            strategy: RetryStrategy::Exponential,
            ..Default::default()
        }
    }

    /// Linear backoff configuration.
    pub fn linear(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            strategy: RetryStrategy::Linear,
            ..Default::default()
        }
    }

    /// Constant-delay configuration.
    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            strategy: RetryStrategy::Constant,
            ..Default::default()
        }
    }

    /// Fibonacci backoff configuration.
    pub fn fibonacci(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            strategy: RetryStrategy::Fibonacci,
            ..Default::default()
        }
    }

    /// Decorrelated-jitter configuration.
    pub fn decorrelated(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            strategy: RetryStrategy::Decorrelated,
            ..Default::default()
        }
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Set the exponential growth base.
    pub fn with_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the jitter factor range.
    pub fn with_jitter_range(mut self, low: f64, high: f64) -> Self {
        self.jitter_range = (low, high);
        self
    }

    /// Set the retryable error categories.
    pub fn retry_on(mut self, categories: Vec<ErrorCategory>) -> Self {
        self.retry_on_categories = categories;
        self
    }

    /// Set the retryable status codes.
    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_on_status_codes = codes;
        self
    }

    /// Set an absolute deadline for the whole retry loop.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Enable a shared retry budget of `max_retries` per `window`.
    pub fn with_budget(mut self, max_retries: u32, window: Duration) -> Self {
        self.retry_budget = Some(max_retries);
        self.budget_window = window;
        self
    }

    /// Check whether a failure is worth retrying under this configuration.
    pub fn should_retry(&self, error: &Error) -> bool {
        if self.retry_on_categories.contains(&error.category()) {
            return true;
        }
        error.category() == ErrorCategory::Api
            && error
                .status()
                .is_some_and(|status| self.retry_on_status_codes.contains(&status))
    }
}

/// Record of a single attempt within a retry loop.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Delay slept before this attempt.
    pub delay: Duration,
    /// Wall-clock time the attempt started.
    pub timestamp: DateTime<Utc>,
    /// The failure, if the attempt failed.
    pub error: Option<Error>,
    /// Whether the attempt succeeded.
    pub succeeded: bool,
}

/// Outcome of a retry loop: either the value or the full failure history.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// Whether any attempt succeeded.
    pub succeeded: bool,
    /// The successful value, if any.
    pub result: Option<T>,
    /// Every attempt made, in order.
    pub attempts: Vec<RetryAttempt>,
    /// Total time spent in the loop, delays included.
    pub total_duration: Duration,
    /// The error from the last attempt, when the loop gave up.
    pub final_error: Option<Error>,
}

impl<T> RetryResult<T> {
    /// Collapse into a plain `Result`, losing the attempt history.
    pub fn into_result(self) -> crate::error::Result<T> {
        match self.result {
            Some(value) => Ok(value),
            None => Err(self
                .final_error
                .unwrap_or_else(|| Error::unknown("retry gave up before any attempt"))),
        }
    }
}

// ============================================================================
// Retry Budget
// ============================================================================

/// Shared cap on attempts within a sliding time window, preventing retry
/// storms across operations that name the same budget key.
pub struct RetryBudget {
    max_retries: u32,
    window: Duration,
    attempts: Mutex<VecDeque<Instant>>,
}

/// Snapshot of budget consumption.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    /// Attempts currently inside the window.
    pub used: u32,
    /// Attempts still admitted by the window.
    pub available: u32,
    /// Used fraction, 0-100.
    pub percent: f64,
}

impl RetryBudget {
    /// Create a budget admitting `max_retries` attempts per `window`.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            attempts: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically check the window and record an attempt if admitted.
    pub fn try_consume(&self) -> bool {
        let mut attempts = self.attempts.lock();
        Self::prune(&mut attempts, self.window);
        if (attempts.len() as u32) < self.max_retries {
            attempts.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    /// Check whether the window currently admits an attempt.
    pub fn can_retry(&self) -> bool {
        let mut attempts = self.attempts.lock();
        Self::prune(&mut attempts, self.window);
        (attempts.len() as u32) < self.max_retries
    }

    /// Current consumption.
    pub fn usage(&self) -> BudgetUsage {
        let mut attempts = self.attempts.lock();
        Self::prune(&mut attempts, self.window);
        let used = attempts.len() as u32;
        BudgetUsage {
            used,
            available: self.max_retries.saturating_sub(used),
            percent: if self.max_retries > 0 {
                f64::from(used) / f64::from(self.max_retries) * 100.0
            } else {
                0.0
            },
        }
    }

    fn prune(attempts: &mut VecDeque<Instant>, window: Duration) {
        let now = Instant::now();
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) > window {
                attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Retry Manager
// ============================================================================

/// Snapshot of manager-wide retry metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RetryMetrics {
    /// Failed attempts that were followed by another try.
    pub total_retries: u64,
    /// Operations that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Operations that exhausted all attempts.
    pub failed_retries: u64,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
    /// Retry loops stopped by an exhausted budget.
    pub retry_storms_prevented: u64,
    /// successful_retries / total_retries, 0-100.
    pub success_rate: f64,
    /// Average sleep per retry.
    pub average_delay: Duration,
}

/// Executes operations under a retry policy and tracks shared budgets.
pub struct RetryManager {
    default_config: RetryConfig,
    budgets: RwLock<HashMap<String, Arc<RetryBudget>>>,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_retries: AtomicU64,
    total_delay_micros: AtomicU64,
    retry_storms_prevented: AtomicU64,
    fibonacci: Mutex<Vec<u64>>,
}

/// Decision for the next attempt of a retry session.
enum AttemptPlan {
    Proceed { delay: Duration },
    DeadlineExceeded,
    BudgetExhausted,
}

/// Per-call state shared by the async and blocking retry loops.
struct RetrySession {
    started: Instant,
    deadline: Option<Instant>,
    attempts: Vec<RetryAttempt>,
    prev_delay: Duration,
    attempt_index: u32,
}

impl RetrySession {
    fn new(config: &RetryConfig) -> Self {
        Self {
            started: Instant::now(),
            deadline: config.deadline.map(|d| Instant::now() + d),
            attempts: Vec::new(),
            prev_delay: config.initial_delay,
            attempt_index: 0,
        }
    }

    fn record(&mut self, delay: Duration, timestamp: DateTime<Utc>, error: Option<Error>) {
        let succeeded = error.is_none();
        self.attempts.push(RetryAttempt {
            attempt_number: self.attempt_index + 1,
            delay,
            timestamp,
            error,
            succeeded,
        });
        self.attempt_index += 1;
    }

    fn finish_success<T>(self, value: T) -> RetryResult<T> {
        RetryResult {
            succeeded: true,
            result: Some(value),
            total_duration: self.started.elapsed(),
            final_error: None,
            attempts: self.attempts,
        }
    }

    fn finish_failure<T>(self) -> RetryResult<T> {
        let final_error = self.attempts.last().and_then(|a| a.error.clone());
        RetryResult {
            succeeded: false,
            result: None,
            total_duration: self.started.elapsed(),
            final_error,
            attempts: self.attempts,
        }
    }
}

impl RetryManager {
    /// Create a manager with the default configuration.
    pub fn new() -> Self {
        Self::with_default_config(RetryConfig::default())
    }

    /// Create a manager whose [`Self::default_config`] is the given config.
    pub fn with_default_config(default_config: RetryConfig) -> Self {
        Self {
            default_config,
            budgets: RwLock::new(HashMap::new()),
            total_retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            failed_retries: AtomicU64::new(0),
            total_delay_micros: AtomicU64::new(0),
            retry_storms_prevented: AtomicU64::new(0),
            fibonacci: Mutex::new(vec![0, 1]),
        }
    }

    /// Baseline configuration for call sites without a policy of their own:
    /// `manager.retry(manager.default_config(), op)`.
    pub fn default_config(&self) -> &RetryConfig {
        &self.default_config
    }

    /// Execute an async operation under the retry policy.
    pub async fn retry<T, F, Fut>(&self, config: &RetryConfig, op: F) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        self.run_async(config, None, op).await
    }

    /// Execute an async operation, drawing attempts from the named budget.
    pub async fn retry_with_budget<T, F, Fut>(
        &self,
        config: &RetryConfig,
        budget_key: &str,
        op: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        self.run_async(config, Some(budget_key), op).await
    }

    /// Execute a blocking operation under the retry policy.
    pub fn retry_blocking<T, F>(&self, config: &RetryConfig, op: F) -> RetryResult<T>
    where
        F: FnMut() -> crate::error::Result<T>,
    {
        self.run_blocking(config, None, op)
    }

    /// Execute a blocking operation, drawing attempts from the named budget.
    pub fn retry_blocking_with_budget<T, F>(
        &self,
        config: &RetryConfig,
        budget_key: &str,
        op: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> crate::error::Result<T>,
    {
        self.run_blocking(config, Some(budget_key), op)
    }

    async fn run_async<T, F, Fut>(
        &self,
        config: &RetryConfig,
        budget_key: Option<&str>,
        mut op: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::error::Result<T>>,
    {
        let budget = budget_key.and_then(|key| self.budget_for(key, config));
        let mut session = RetrySession::new(config);

        while session.attempt_index < config.max_attempts {
            let delay = match self.plan_attempt(config, &mut session, budget.as_deref()) {
                AttemptPlan::Proceed { delay } => delay,
                AttemptPlan::DeadlineExceeded | AttemptPlan::BudgetExhausted => break,
            };

            if delay > Duration::ZERO {
                debug!(
                    attempt = session.attempt_index + 1,
                    max_attempts = config.max_attempts,
                    delay = ?delay,
                    "Waiting before retry attempt"
                );
                tokio::time::sleep(delay).await;
                self.total_delay_micros
                    .fetch_add(delay.as_micros() as u64, Ordering::Relaxed);
            }

            let timestamp = Utc::now();
            match op().await {
                Ok(value) => {
                    session.record(delay, timestamp, None);
                    self.settle_success(&session);
                    return session.finish_success(value);
                }
                Err(err) => {
                    if !self.settle_failure(config, &mut session, delay, timestamp, err) {
                        break;
                    }
                }
            }
        }

        session.finish_failure()
    }

    fn run_blocking<T, F>(
        &self,
        config: &RetryConfig,
        budget_key: Option<&str>,
        mut op: F,
    ) -> RetryResult<T>
    where
        F: FnMut() -> crate::error::Result<T>,
    {
        let budget = budget_key.and_then(|key| self.budget_for(key, config));
        let mut session = RetrySession::new(config);

        while session.attempt_index < config.max_attempts {
            let delay = match self.plan_attempt(config, &mut session, budget.as_deref()) {
                AttemptPlan::Proceed { delay } => delay,
                AttemptPlan::DeadlineExceeded | AttemptPlan::BudgetExhausted => break,
            };

            if delay > Duration::ZERO {
                debug!(
                    attempt = session.attempt_index + 1,
                    max_attempts = config.max_attempts,
                    delay = ?delay,
                    "Waiting before retry attempt"
                );
                std::thread::sleep(delay);
                self.total_delay_micros
                    .fetch_add(delay.as_micros() as u64, Ordering::Relaxed);
            }

            let timestamp = Utc::now();
            match op() {
                Ok(value) => {
                    session.record(delay, timestamp, None);
                    self.settle_success(&session);
                    return session.finish_success(value);
                }
                Err(err) => {
                    if !self.settle_failure(config, &mut session, delay, timestamp, err) {
                        break;
                    }
                }
            }
        }

        session.finish_failure()
    }

    /// Gate the next attempt on the deadline and budget, then compute its
    /// backoff delay. Called with the lock-free session state only.
    fn plan_attempt(
        &self,
        config: &RetryConfig,
        session: &mut RetrySession,
        budget: Option<&RetryBudget>,
    ) -> AttemptPlan {
        if let Some(deadline) = session.deadline
            && Instant::now() > deadline
        {
            warn!(
                attempts = session.attempt_index,
                "Retry deadline exceeded, giving up"
            );
            return AttemptPlan::DeadlineExceeded;
        }

        if let Some(budget) = budget
            && !budget.try_consume()
        {
            warn!("Retry budget exhausted, preventing retry storm");
            self.retry_storms_prevented.fetch_add(1, Ordering::Relaxed);
            return AttemptPlan::BudgetExhausted;
        }

        let delay = if session.attempt_index == 0 {
            Duration::ZERO
        } else {
            self.compute_delay(config, session.attempt_index, &mut session.prev_delay)
        };
        AttemptPlan::Proceed { delay }
    }

    fn settle_success(&self, session: &RetrySession) {
        if session.attempts.len() > 1 {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
            debug!(attempts = session.attempts.len(), "Retry succeeded");
        }
    }

    /// Record a failed attempt; returns whether the loop should continue.
    fn settle_failure(
        &self,
        config: &RetryConfig,
        session: &mut RetrySession,
        delay: Duration,
        timestamp: DateTime<Utc>,
        err: Error,
    ) -> bool {
        let retryable = config.should_retry(&err);
        warn!(
            attempt = session.attempt_index + 1,
            category = %err.category(),
            retryable,
            error = %err,
            "Attempt failed"
        );
        session.record(delay, timestamp, Some(err));

        if !retryable {
            return false;
        }

        self.total_retries.fetch_add(1, Ordering::Relaxed);
        if session.attempt_index >= config.max_attempts {
            self.failed_retries.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Compute the backoff delay for a 0-based attempt index (> 0).
    fn compute_delay(&self, config: &RetryConfig, attempt: u32, prev_delay: &mut Duration) -> Duration {
        let initial = config.initial_delay;
        let max = config.max_delay;

        let delay = match config.strategy {
            RetryStrategy::Exponential => {
                let factor = config.exponential_base.powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(max)
            }
            RetryStrategy::Linear => initial.saturating_mul(attempt + 1).min(max),
            RetryStrategy::Constant => initial,
            RetryStrategy::Fibonacci => {
                let fib = self.fibonacci_number(attempt + 1);
                let millis = (initial.as_millis() as u128).saturating_mul(u128::from(fib));
                Duration::from_millis(millis.min(max.as_millis()) as u64)
            }
            RetryStrategy::Decorrelated => {
                let low = initial.as_millis() as u64;
                let high = prev_delay.saturating_mul(3).as_millis() as u64;
                let millis = if high > low {
                    rand::thread_rng().gen_range(low..=high)
                } else {
                    low
                };
                let delay = Duration::from_millis(millis).min(max);
                *prev_delay = delay;
                return delay;
            }
        };

        if config.jitter {
            let (low, high) = config.jitter_range;
            let factor = rand::thread_rng().gen_range(low..high);
            delay.mul_f64(factor)
        } else {
            delay
        }
    }

    /// The nth Fibonacci number, memoized across calls.
    fn fibonacci_number(&self, n: u32) -> u64 {
        let mut cache = self.fibonacci.lock();
        while cache.len() <= n as usize {
            let next = cache[cache.len() - 1].saturating_add(cache[cache.len() - 2]);
            cache.push(next);
        }
        cache[n as usize]
    }

    fn budget_for(&self, key: &str, config: &RetryConfig) -> Option<Arc<RetryBudget>> {
        let max_retries = config.retry_budget?;
        if let Some(budget) = self.budgets.read().get(key) {
            return Some(Arc::clone(budget));
        }
        let mut budgets = self.budgets.write();
        Some(Arc::clone(budgets.entry(key.to_string()).or_insert_with(
            || Arc::new(RetryBudget::new(max_retries, config.budget_window)),
        )))
    }

    /// The budget registered under `key`, if any.
    pub fn budget(&self, key: &str) -> Option<Arc<RetryBudget>> {
        self.budgets.read().get(key).map(Arc::clone)
    }

    /// Consumption of every registered budget, keyed by name.
    pub fn budget_usage(&self) -> HashMap<String, BudgetUsage> {
        self.budgets
            .read()
            .iter()
            .map(|(key, budget)| (key.clone(), budget.usage()))
            .collect()
    }

    /// Snapshot of the manager-wide metrics.
    pub fn metrics(&self) -> RetryMetrics {
        let total_retries = self.total_retries.load(Ordering::Relaxed);
        let successful_retries = self.successful_retries.load(Ordering::Relaxed);
        let total_delay = Duration::from_micros(self.total_delay_micros.load(Ordering::Relaxed));

        RetryMetrics {
            total_retries,
            successful_retries,
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            total_delay,
            retry_storms_prevented: self.retry_storms_prevented.load(Ordering::Relaxed),
            success_rate: if total_retries > 0 {
                successful_retries as f64 / total_retries as f64 * 100.0
            } else {
                0.0
            },
            average_delay: if total_retries > 0 {
                total_delay / total_retries as u32
            } else {
                Duration::ZERO
            },
        }
    }

    /// Zero all metric counters. Budgets are left in place.
    pub fn reset_metrics(&self) {
        self.total_retries.store(0, Ordering::Relaxed);
        self.successful_retries.store(0, Ordering::Relaxed);
        self.failed_retries.store(0, Ordering::Relaxed);
        self.total_delay_micros.store(0, Ordering::Relaxed);
        self.retry_storms_prevented.store(0, Ordering::Relaxed);
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new()
    }
}
