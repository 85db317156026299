//! Integration tests for common reliability workflows.
//!
//! These tests exercise the components together the way services compose
//! them: operations retried under a policy, dependencies guarded by named
//! breakers, and connections drawn from shared pools.

use stanchion::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// Test Factory
// =============================================================================

struct TestConn;

#[derive(Default)]
struct FactoryProbes {
    created: AtomicU32,
    fail_create: AtomicBool,
}

struct TestFactory {
    probes: Arc<FactoryProbes>,
}

impl TestFactory {
    fn new() -> (Self, Arc<FactoryProbes>) {
        let probes = Arc::new(FactoryProbes::default());
        (
            Self {
                probes: Arc::clone(&probes),
            },
            probes,
        )
    }
}

impl ConnectionFactory for TestFactory {
    type Connection = TestConn;

    fn create(&self) -> Result<TestConn> {
        if self.probes.fail_create.load(Ordering::SeqCst) {
            return Err(Error::database("backend unreachable"));
        }
        self.probes.created.fetch_add(1, Ordering::SeqCst);
        Ok(TestConn)
    }

    fn validate(&self, _conn: &mut TestConn) -> bool {
        true
    }
}

// =============================================================================
// Retry Workflows
// =============================================================================

#[tokio::test]
async fn test_flaky_operation_recovers_within_attempts() {
    let manager = RetryManager::new();
    let config = RetryConfig::constant(3, Duration::ZERO).with_jitter(false);
    let calls = AtomicU32::new(0);

    let outcome = manager
        .retry(&config, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::network("connection reset"))
                } else {
                    Ok("payload")
                }
            }
        })
        .await;

    assert!(outcome.succeeded);
    assert_eq!(outcome.result, Some("payload"));
    assert_eq!(outcome.attempts.len(), 3);
    assert!(!outcome.attempts[0].succeeded);
    assert!(!outcome.attempts[1].succeeded);
    assert!(outcome.attempts[2].succeeded);
}

#[tokio::test]
async fn test_shared_budget_limits_retries_across_operations() {
    let manager = RetryManager::new();
    let config = RetryConfig::constant(10, Duration::ZERO)
        .with_jitter(false)
        .with_budget(4, Duration::from_secs(60));

    let first: RetryResult<()> = manager
        .retry_with_budget(&config, "backend", || async { Err(Error::api("boom")) })
        .await;
    let second: RetryResult<()> = manager
        .retry_with_budget(&config, "backend", || async { Err(Error::api("boom")) })
        .await;

    // Four attempts total are admitted across both operations.
    assert_eq!(first.attempts.len() + second.attempts.len(), 4);
    assert_eq!(manager.metrics().retry_storms_prevented, 2);
}

// =============================================================================
// Circuit Breaker Workflows
// =============================================================================

#[tokio::test]
async fn test_breaker_fails_fast_after_threshold() {
    let breaker = CircuitBreaker::new(
        "always-down",
        CircuitBreakerConfig::new().failure_threshold(2),
    );
    let invocations = AtomicU32::new(0);

    // First two calls invoke the operation and surface its error.
    for _ in 0..2 {
        let result: std::result::Result<(), _> = breaker
            .call(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::network("no route to host")) }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Execution(_))));
    }
    assert_eq!(breaker.status().failure_count, 2);

    // Third call fails fast without touching the operation.
    let result: std::result::Result<(), _> = breaker
        .call(|| {
            invocations.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_stops_once_breaker_opens() {
    let manager = RetryManager::new();
    let breaker = CircuitBreaker::new(
        "downstream",
        CircuitBreakerConfig::new().failure_threshold(2),
    );
    let config = RetryConfig::constant(5, Duration::ZERO).with_jitter(false);
    let invocations = Arc::new(AtomicU32::new(0));

    let outcome: RetryResult<()> = manager
        .retry(&config, || {
            let breaker = Arc::clone(&breaker);
            let invocations = Arc::clone(&invocations);
            async move {
                breaker
                    .call(|| async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Err(Error::network("down"))
                    })
                    .await
                    .map_err(Error::from)
            }
        })
        .await;

    // Two real failures trip the breaker; the rejection that follows is not
    // a retryable category, so the retry loop stops instead of hammering.
    assert!(!outcome.succeeded);
    assert_eq!(outcome.attempts.len(), 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(
        outcome.final_error.unwrap().category(),
        ErrorCategory::Unknown
    );
}

#[tokio::test]
async fn test_breaker_recovery_cycle() {
    let breaker = CircuitBreaker::new(
        "recovering",
        CircuitBreakerConfig::new()
            .failure_threshold(1)
            .success_threshold(1)
            .reset_timeout(Duration::from_millis(50)),
    );

    let _: std::result::Result<(), _> =
        breaker.call(|| async { Err(Error::api("503").with_status(503)) }).await;
    let _: std::result::Result<(), _> = breaker.call(|| async { Ok(()) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The dependency recovered; one successful trial closes the circuit.
    let result = breaker.call(|| async { Ok("healthy") }).await;
    assert_eq!(result.unwrap(), "healthy");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

// =============================================================================
// Connection Pool Workflows
// =============================================================================

#[test]
fn test_second_acquire_times_out_at_capacity() {
    let (factory, _probes) = TestFactory::new();
    let config = PoolConfig::new(1, 1)
        .max_overflow(0)
        .acquire_timeout(Duration::from_millis(100))
        .health_check_interval(Duration::ZERO);
    let pool = ConnectionPool::new("tiny", factory, config);

    let first = pool.acquire().unwrap();

    let waiter_pool = pool.clone();
    let waiter = std::thread::spawn(move || {
        let started = Instant::now();
        let result = waiter_pool.acquire();
        (result.map(|_| ()), started.elapsed())
    });

    let (result, waited) = waiter.join().unwrap();
    assert!(matches!(result, Err(PoolError::Timeout { .. })));
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(600));
    drop(first);
}

#[test]
fn test_combined_capacity_never_exceeded() {
    let (factory, _probes) = TestFactory::new();
    let config = PoolConfig::new(0, 2)
        .max_overflow(1)
        .acquire_timeout(Duration::from_millis(200))
        .health_check_interval(Duration::ZERO);
    let pool = ConnectionPool::new("bounded", factory, config);

    let concurrent = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));
    let successes = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let pool = pool.clone();
            let concurrent = Arc::clone(&concurrent);
            let high_water = Arc::clone(&high_water);
            let successes = Arc::clone(&successes);
            std::thread::spawn(move || {
                if let Ok(conn) = pool.acquire() {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    successes.fetch_add(1, Ordering::SeqCst);
                    drop(conn);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    // Never more than max_size + max_overflow connections out at once, and
    // waiting callers were served as slots freed up.
    assert!(high_water.load(Ordering::SeqCst) <= 3);
    assert_eq!(successes.load(Ordering::SeqCst), 6);
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn test_pooled_operation_recovers_under_retry() {
    let manager = RetryManager::new();
    let (factory, probes) = TestFactory::new();
    let config = PoolConfig::new(0, 1)
        .acquire_timeout(Duration::from_millis(100))
        .health_check_interval(Duration::ZERO);
    let pool = ConnectionPool::new("flaky-backend", factory, config);

    // First acquire hits a backend that is briefly unreachable.
    probes.fail_create.store(true, Ordering::SeqCst);
    let retry_config = RetryConfig::constant(3, Duration::ZERO).with_jitter(false);

    let outcome = manager.retry_blocking(&retry_config, || {
        let result = pool.acquire().map_err(Error::from).map(|conn| conn.id());
        // Backend comes back before the next attempt.
        probes.fail_create.store(false, Ordering::SeqCst);
        result
    });

    assert!(outcome.succeeded);
    assert_eq!(outcome.attempts.len(), 2);
    assert!(!outcome.attempts[0].succeeded);
}

// =============================================================================
// Registry Workflows
// =============================================================================

#[tokio::test]
async fn test_call_sites_share_breaker_by_name() {
    let registry = CircuitBreakerRegistry::new();

    // Two independent call sites guard the same logical dependency.
    let site_a = registry.get_or_create("search", CircuitBreakerConfig::new().failure_threshold(2));
    let site_b = registry.get_or_create("search", CircuitBreakerConfig::new());

    let _: std::result::Result<(), _> =
        site_a.call(|| async { Err(Error::network("down")) }).await;
    let _: std::result::Result<(), _> =
        site_b.call(|| async { Err(Error::network("down")) }).await;

    // The shared breaker saw both failures and opens for everyone.
    let result: std::result::Result<(), _> = site_a.call(|| async { Ok(()) }).await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));

    let status = registry.get_all_status();
    assert_eq!(status["search"].total_failures, 2);
}

#[test]
fn test_pool_registry_lifecycle() {
    let registry: PoolRegistry<TestFactory> = PoolRegistry::new();
    let config = PoolConfig::new(1, 2).health_check_interval(Duration::ZERO);

    let pool = registry.get_or_create("graph", config.clone(), || TestFactory::new().0);
    let again = registry.get_or_create("graph", config, || TestFactory::new().0);

    // Same underlying pool: one eager connection, not two.
    assert_eq!(pool.stats().available, 1);
    assert_eq!(again.stats().available, 1);

    registry.close_all();
    assert!(pool.is_closed());
    assert!(registry.names().is_empty());
}

// =============================================================================
// Taxonomy Workflows
// =============================================================================

#[tokio::test]
async fn test_failures_feed_the_error_log() {
    let log = ErrorLog::new(100);
    let breaker = CircuitBreaker::new(
        "audited",
        CircuitBreakerConfig::new().failure_threshold(10),
    );

    for _ in 0..2 {
        let result: std::result::Result<(), _> = breaker
            .call(|| async { Err(Error::database("lost connection")) })
            .await;
        if let Err(CircuitBreakerError::Execution(err)) = result {
            log.record(&err);
        }
    }

    let summary = log.summary();
    assert_eq!(summary.total_errors, 2);
    assert_eq!(summary.by_category.get("database"), Some(&2));

    let recent = log.recent(10);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].error_type, "DatabaseError");
    assert!(!recent[0].recovery_suggestions.is_empty());
}
