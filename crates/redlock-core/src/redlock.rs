//! Lock client entry point

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};
use crate::extension::{AutoExtension, LockSignal};
use crate::handle::LockHandle;
use crate::quorum::QuorumCoordinator;
use crate::retry::RetryScheduler;
use crate::settings::{AcquireOptions, LockSettings};
use crate::store::{LockStore, StoreHandle};
use crate::token::ResourceSet;

/// Distributed lock client over a fixed set of independent store instances
#[derive(Debug, Clone)]
pub struct Redlock {
    scheduler: RetryScheduler,
}

impl Redlock {
    /// Build a client over `stores`
    ///
    /// The instance set is fixed for the lifetime of the client.
    pub fn new(stores: Vec<Arc<dyn LockStore>>, settings: LockSettings) -> Result<Self> {
        if stores.is_empty() {
            return Err(LockError::configuration(
                "at least one store instance is required",
            ));
        }
        settings.validate()?;

        let timeout = settings.store_timeout();
        let handles = stores
            .into_iter()
            .enumerate()
            .map(|(index, store)| StoreHandle::new(index, store, timeout))
            .collect();
        let coordinator = QuorumCoordinator::new(handles, Arc::new(settings));

        tracing::info!(
            instances = coordinator.instance_count(),
            quorum = coordinator.quorum(),
            "lock client ready"
        );
        Ok(Self {
            scheduler: RetryScheduler::new(coordinator),
        })
    }

    pub fn quorum(&self) -> usize {
        self.scheduler.coordinator().quorum()
    }

    pub fn instance_count(&self) -> usize {
        self.scheduler.coordinator().instance_count()
    }

    pub fn settings(&self) -> &LockSettings {
        self.scheduler.settings()
    }

    /// Acquire `resources` for `ttl` using the configured retry policy
    pub async fn acquire(&self, resources: &ResourceSet, ttl: Duration) -> Result<LockHandle> {
        self.acquire_with(
            resources,
            ttl,
            &AcquireOptions::default(),
            &CancellationToken::new(),
        )
        .await
    }

    /// Acquire with per-call retry overrides and cancellation
    pub async fn acquire_with(
        &self,
        resources: &ResourceSet,
        ttl: Duration,
        options: &AcquireOptions,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let policy = options.apply(self.settings());
        policy.validate()?;
        let grant = self
            .scheduler
            .acquire(resources.shared(), ttl, &policy, cancel)
            .await?;

        tracing::info!(
            resources = %resources,
            ttl_ms = ttl.as_millis() as u64,
            attempts = grant.attempts,
            "lock acquired"
        );
        Ok(LockHandle::new(
            self.scheduler.clone(),
            resources.clone(),
            ttl,
            grant,
        ))
    }

    /// Keep `handle` alive in the background with the configured threshold
    pub fn auto_extend(&self, handle: LockHandle) -> AutoExtension {
        AutoExtension::spawn(handle, self.settings().automatic_extension_threshold())
    }

    /// Run `routine` while holding `resources`
    ///
    /// The lock is extended automatically while the routine runs and released
    /// afterwards. The routine receives a [`LockSignal`] that fires if the lock
    /// is lost; whether to stop early is up to the routine. If the lock was
    /// lost, the routine's output is discarded and the loss is returned.
    pub async fn using<F, Fut, T>(
        &self,
        resources: &ResourceSet,
        ttl: Duration,
        routine: F,
    ) -> Result<T>
    where
        F: FnOnce(LockSignal) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(resources, ttl).await?;
        let extension = self.auto_extend(handle);
        let signal = extension.signal();

        let output = routine(signal.clone()).await;

        if let Some(e) = signal.error() {
            // Still join the task so the gauge and state settle
            let _ = extension.stop().await;
            return Err(e);
        }
        let report = extension.release().await?;
        if !report.is_acknowledged() {
            tracing::warn!(resources = %resources, "release after routine was not acknowledged");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::MemoryStore;

    fn cluster(n: usize) -> (Redlock, Vec<Arc<MemoryStore>>) {
        let stores: Vec<Arc<MemoryStore>> = (0..n)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect();
        let redlock = Redlock::new(
            stores
                .iter()
                .map(|s| s.clone() as Arc<dyn LockStore>)
                .collect(),
            LockSettings::default(),
        )
        .unwrap();
        (redlock, stores)
    }

    #[test]
    fn test_new_rejects_empty_store_list() {
        let err = Redlock::new(Vec::new(), LockSettings::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_new_rejects_invalid_settings() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryStore::new("mem"));
        let settings = LockSettings {
            drift_factor: -0.5,
            ..Default::default()
        };
        let err = Redlock::new(vec![store], settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_quorum_of_cluster() {
        let (redlock, _) = cluster(5);
        assert_eq!(redlock.instance_count(), 5);
        assert_eq!(redlock.quorum(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_no_retry() {
        let (redlock, _) = cluster(1);
        let resources = ResourceSet::single("lock:001").unwrap();
        let _held = redlock
            .acquire(&resources, Duration::from_secs(2))
            .await
            .unwrap();

        let err = redlock
            .acquire_with(
                &resources,
                Duration::from_secs(1),
                &AcquireOptions::no_retry(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            LockError::QuorumNotAchieved { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_rejects_overrides_breaking_timeouts() {
        let (redlock, stores) = cluster(3);
        let resources = ResourceSet::single("lock:001").unwrap();
        let options = AcquireOptions {
            retry_delay_ms: Some(10),
            ..Default::default()
        };

        let err = redlock
            .acquire_with(
                &resources,
                Duration::from_secs(1),
                &options,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(stores.iter().all(|s| s.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_acquire_rolls_back_late_write() {
        let (redlock, stores) = cluster(1);
        stores[0].set_latency(Duration::from_millis(40));
        let resources = ResourceSet::single("lock:q").unwrap();

        let acquire = redlock.acquire(&resources, Duration::from_secs(30));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), acquire)
                .await
                .is_err()
        );

        stores[0].set_latency(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(stores[0].get("lock:q"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_using_releases_after_routine() {
        let (redlock, stores) = cluster(3);
        let resources = ResourceSet::single("lock:job").unwrap();

        let value = redlock
            .using(&resources, Duration::from_secs(1), |signal| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                assert!(!signal.is_lost());
                42
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert!(stores.iter().all(|s| s.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_using_reports_lost_lock() {
        let (redlock, stores) = cluster(1);
        let resources = ResourceSet::single("lock:job").unwrap();
        let store = stores[0].clone();

        let err = redlock
            .using(&resources, Duration::from_secs(1), |signal| async move {
                store.put("lock:job", "intruder", Duration::from_secs(60));
                signal.lost().await
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuorumNotAchieved);
        assert_eq!(stores[0].get("lock:job").as_deref(), Some("intruder"));
    }
}
