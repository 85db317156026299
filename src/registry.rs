//! Named registries for sharing reliability components across call sites.
//!
//! Every call site that references the same name gets the same instance, so
//! one logical dependency ("billing-api", "graph-db") is guarded by one
//! breaker and served by one pool. Registries are plain objects: construct
//! one, share it by reference or clone, and pass it where it is needed.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of named circuit breakers.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the breaker registered under `name`, creating it with `config`
    /// if absent. The first caller's config wins; later configs for the
    /// same name are ignored.
    pub fn get_or_create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(name.to_string())
                .or_insert_with(|| CircuitBreaker::new(name, config)),
        )
    }

    /// The breaker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).map(Arc::clone)
    }

    /// Names of all registered breakers.
    pub fn names(&self) -> Vec<String> {
        self.breakers.read().keys().cloned().collect()
    }

    /// Status of every registered breaker, keyed by name.
    pub fn get_all_status(&self) -> HashMap<String, CircuitBreakerStatus> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.status()))
            .collect()
    }

    /// Reset the breaker registered under `name`, if any.
    pub fn reset(&self, name: &str) {
        if let Some(breaker) = self.breakers.read().get(name) {
            breaker.reset();
        }
    }

    /// Reset every registered breaker to closed.
    pub fn reset_all(&self) {
        info!("Resetting all circuit breakers");
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

/// Registry of named connection pools sharing one factory type.
pub struct PoolRegistry<F: ConnectionFactory> {
    pools: RwLock<HashMap<String, ConnectionPool<F>>>,
}

impl<F: ConnectionFactory> Default for PoolRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ConnectionFactory> PoolRegistry<F> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Get the pool registered under `name`, creating it with `config` and
    /// a factory from `make_factory` if absent. The first caller's config
    /// and factory win; later ones for the same name are ignored.
    pub fn get_or_create(
        &self,
        name: &str,
        config: PoolConfig,
        make_factory: impl FnOnce() -> F,
    ) -> ConnectionPool<F> {
        if let Some(pool) = self.pools.read().get(name) {
            return pool.clone();
        }
        let mut pools = self.pools.write();
        pools
            .entry(name.to_string())
            .or_insert_with(|| ConnectionPool::new(name, make_factory(), config))
            .clone()
    }

    /// The pool registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<ConnectionPool<F>> {
        self.pools.read().get(name).cloned()
    }

    /// Names of all registered pools.
    pub fn names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    /// Statistics for every registered pool, keyed by name.
    pub fn get_all_stats(&self) -> HashMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Close the pool registered under `name` and remove it.
    pub fn close(&self, name: &str) {
        if let Some(pool) = self.pools.write().remove(name) {
            pool.close();
        }
    }

    /// Close and remove every registered pool.
    pub fn close_all(&self) {
        info!("Closing all connection pools");
        let pools: Vec<_> = self.pools.write().drain().collect();
        for (_, pool) in pools {
            pool.close();
        }
    }
}
