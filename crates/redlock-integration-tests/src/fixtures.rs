//! Store fixtures

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redlock_core::{LockSettings, LockStore, MemoryStore, Operation, Redlock};
use redlock_redis::RedisStoreConfig;

/// A client over `n` in-memory instances
pub struct MemoryCluster {
    pub stores: Vec<Arc<MemoryStore>>,
    pub redlock: Redlock,
}

impl MemoryCluster {
    pub fn new(instances: usize) -> Self {
        Self::with_settings(instances, LockSettings::default())
    }

    pub fn with_settings(instances: usize, settings: LockSettings) -> Self {
        let stores: Vec<Arc<MemoryStore>> = (0..instances)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect();
        let redlock = Redlock::new(
            stores
                .iter()
                .map(|store| store.clone() as Arc<dyn LockStore>)
                .collect(),
            settings,
        )
        .expect("valid cluster settings");
        Self { stores, redlock }
    }

    pub fn store(&self, index: usize) -> &Arc<MemoryStore> {
        &self.stores[index]
    }

    /// Instances where `key` currently holds `value`
    pub fn holders(&self, key: &str, value: &str) -> usize {
        self.stores
            .iter()
            .filter(|store| store.get(key).as_deref() == Some(value))
            .count()
    }

    /// Instances where `key` is live with any value
    pub fn live(&self, key: &str) -> usize {
        self.stores
            .iter()
            .filter(|store| store.get(key).is_some())
            .count()
    }

    /// Take `count` instances offline, starting from the last one
    pub fn fail_last(&self, count: usize) {
        for store in self.stores.iter().rev().take(count) {
            store.set_available(false);
        }
    }
}

/// Wraps a store and counts the calls reaching it per operation
pub struct CountingStore {
    inner: Arc<dyn LockStore>,
    sets: AtomicU64,
    extends: AtomicU64,
    deletes: AtomicU64,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn LockStore>) -> Self {
        Self {
            inner,
            sets: AtomicU64::new(0),
            extends: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    pub fn calls(&self, operation: Operation) -> u64 {
        let counter = match operation {
            Operation::Acquire => &self.sets,
            Operation::Extend => &self.extends,
            Operation::Release => &self.deletes,
        };
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for CountingStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn try_set(&self, keys: &[String], token: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.try_set(keys, token, ttl).await
    }

    async fn try_extend(
        &self,
        keys: &[String],
        token: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        self.extends.fetch_add(1, Ordering::SeqCst);
        self.inner.try_extend(keys, token, ttl).await
    }

    async fn try_delete(&self, keys: &[String], token: &str) -> anyhow::Result<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.try_delete(keys, token).await
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Run `future` and return how long it took on the tokio clock
pub async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let started = tokio::time::Instant::now();
    let output = future.await;
    (output, started.elapsed())
}

/// Endpoints from `REDLOCK_TEST_REDIS`, a comma-separated list
pub fn redis_configs_from_env() -> Option<Vec<RedisStoreConfig>> {
    let endpoints = std::env::var("REDLOCK_TEST_REDIS").ok()?;
    let configs: Vec<RedisStoreConfig> = endpoints
        .split(',')
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .map(RedisStoreConfig::new)
        .collect();
    (!configs.is_empty()).then_some(configs)
}
