//! A keyed pool map: `get(key)` returns a pool for `key`, creating it
//! atomically on first use; a lost race on creation disposes the loser and
//! returns the winner. `remove(key)` disposes the pool before removing it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::pool::{Bootstrap, ChannelPool, HealthChecker, PoolConfig, PoolHandler};

/// Builds the per-key [`Bootstrap`] a [`ChannelPoolMap`] needs to create a
/// new pool the first time a key is seen (e.g. "connect to this host").
pub trait BootstrapFactory<K>: Send + Sync + 'static {
    fn bootstrap_for(&self, key: &K) -> Arc<dyn Bootstrap>;
}

impl<K, F> BootstrapFactory<K> for F
where
    F: Fn(&K) -> Arc<dyn Bootstrap> + Send + Sync + 'static,
{
    fn bootstrap_for(&self, key: &K) -> Arc<dyn Bootstrap> {
        self(key)
    }
}

/// A keyed collection of [`ChannelPool`]s — one per remote endpoint, for
/// instance. Pools are created lazily and shared behind `Arc` so lookups
/// after the first `get(key)` are cheap clones of the handle.
pub struct ChannelPoolMap<K> {
    config: PoolConfig,
    bootstrap_factory: Arc<dyn BootstrapFactory<K>>,
    health_checker: Arc<dyn HealthChecker>,
    handler: Option<Arc<dyn PoolHandler>>,
    pools: Mutex<HashMap<K, ChannelPool>>,
}

impl<K> ChannelPoolMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(config: PoolConfig, bootstrap_factory: Arc<dyn BootstrapFactory<K>>) -> Self {
        Self {
            config,
            bootstrap_factory,
            health_checker: Arc::new(crate::pool::AlwaysHealthy),
            handler: None,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_health_checker(mut self, health_checker: Arc<dyn HealthChecker>) -> Self {
        self.health_checker = health_checker;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn PoolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Returns the pool for `key`, creating it on first use. Construction
    /// happens while holding the map's lock, so there is no "lost race":
    /// the second caller simply observes the first caller's pool. (The
    /// source's race is an artifact of a lock-free map; a single `Mutex`
    /// guarding creation is the idiomatic equivalent and keeps the same
    /// externally-observable contract — at most one pool is ever live per
    /// key.)
    pub async fn get(&self, key: &K) -> ChannelPool {
        let mut pools = self.pools.lock().await;
        if let Some(existing) = pools.get(key) {
            return existing.clone();
        }
        let bootstrap = self.bootstrap_factory.bootstrap_for(key);
        let pool = ChannelPool::with_handler(
            self.config.clone(),
            bootstrap,
            self.health_checker.clone(),
            self.handler.clone(),
        );
        pools.insert(key.clone(), pool.clone());
        pool
    }

    /// Disposes and removes the pool for `key`, if any.
    pub async fn remove(&self, key: &K) {
        let pool = self.pools.lock().await.remove(key);
        if let Some(pool) = pool {
            pool.dispose().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.pools.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pools.lock().await.is_empty()
    }

    /// Disposes every pool currently in the map.
    pub async fn dispose_all(&self) {
        let pools: Vec<ChannelPool> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.dispose().await;
        }
    }
}
