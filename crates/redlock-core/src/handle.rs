//! Held locks
//!
//! A [`LockHandle`] is the caller's proof of ownership. Extending it yields a
//! new handle and retires the old one; releasing it retires it for good.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{InvalidReason, LockError, Result, StoreFailure};
use crate::retry::{Grant, RetryScheduler};
use crate::token::{ResourceSet, Token};

/// Observable state of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Held,
    Expired,
    Released,
    Superseded,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Released,
    Superseded,
    Lost,
}

/// Outcome of a release across all instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    /// Every instance deleted the keys
    Released,
    /// Some instances deleted the keys
    Partial,
    /// No instance acknowledged; the keys stay until their ttl runs out
    Unacknowledged,
    /// `release()` had already run on this handle
    AlreadyReleased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    pub acknowledged: usize,
    pub instances: usize,
    pub failures: Vec<StoreFailure>,
    pub status: ReleaseStatus,
}

impl ReleaseReport {
    pub(crate) fn new(acknowledged: usize, instances: usize, failures: Vec<StoreFailure>) -> Self {
        let status = if acknowledged == 0 {
            ReleaseStatus::Unacknowledged
        } else if acknowledged < instances {
            ReleaseStatus::Partial
        } else {
            ReleaseStatus::Released
        };
        Self {
            acknowledged,
            instances,
            failures,
            status,
        }
    }

    fn already_released(instances: usize) -> Self {
        Self {
            acknowledged: 0,
            instances,
            failures: Vec::new(),
            status: ReleaseStatus::AlreadyReleased,
        }
    }

    /// At least one instance deleted the keys
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged > 0
    }
}

/// A lock held on a quorum of instances
pub struct LockHandle {
    scheduler: RetryScheduler,
    resources: ResourceSet,
    token: Token,
    ttl: Duration,
    valid_until: Instant,
    expiration: u64,
    attempts: u32,
    state: State,
}

impl LockHandle {
    pub(crate) fn new(
        scheduler: RetryScheduler,
        resources: ResourceSet,
        ttl: Duration,
        grant: Grant,
    ) -> Self {
        Self {
            scheduler,
            resources,
            token: grant.token,
            ttl,
            valid_until: grant.valid_until,
            expiration: unix_millis(grant.valid_until),
            attempts: grant.attempts,
            state: State::Active,
        }
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Ttl requested for this handle
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// End of validity as Unix time in milliseconds
    pub fn expiration(&self) -> u64 {
        self.expiration
    }

    /// End of validity on the monotonic clock
    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    /// Validity left, zero once expired or no longer active
    pub fn remaining(&self) -> Duration {
        match self.state {
            State::Active => self.valid_until.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status() == HandleStatus::Held
    }

    /// Attempts the acquire or extend that produced this handle took
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn store_timeout(&self) -> Duration {
        self.scheduler.settings().store_timeout()
    }

    pub fn status(&self) -> HandleStatus {
        match self.state {
            State::Active if Instant::now() < self.valid_until => HandleStatus::Held,
            State::Active => HandleStatus::Expired,
            State::Released => HandleStatus::Released,
            State::Superseded => HandleStatus::Superseded,
            State::Lost => HandleStatus::Lost,
        }
    }

    fn ensure_held(&self) -> Result<()> {
        let reason = match self.status() {
            HandleStatus::Held => return Ok(()),
            HandleStatus::Expired => InvalidReason::Expired,
            HandleStatus::Released => InvalidReason::Released,
            HandleStatus::Superseded => InvalidReason::Superseded,
            HandleStatus::Lost => InvalidReason::Lost,
        };
        Err(LockError::HandleInvalid(reason))
    }

    /// Extend the lock to a fresh `ttl`, returning the new handle
    pub async fn extend(&mut self, ttl: Duration) -> Result<LockHandle> {
        self.extend_with(ttl, &CancellationToken::new()).await
    }

    /// Extend with caller-controlled cancellation
    ///
    /// On success this handle becomes superseded. On a quorum failure it
    /// becomes lost. A cancelled extend leaves it as it was.
    pub async fn extend_with(
        &mut self,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        self.ensure_held()?;

        let result = self
            .scheduler
            .extend(
                self.resources.shared(),
                &self.token,
                ttl,
                self.scheduler.settings(),
                cancel,
            )
            .await;

        match result {
            Ok(grant) => {
                self.state = State::Superseded;
                tracing::debug!(
                    resources = %self.resources,
                    ttl_ms = ttl.as_millis() as u64,
                    attempts = grant.attempts,
                    "lock extended"
                );
                Ok(LockHandle::new(
                    self.scheduler.clone(),
                    self.resources.clone(),
                    ttl,
                    grant,
                ))
            }
            Err(e @ (LockError::Cancelled { .. } | LockError::Configuration(_))) => Err(e),
            Err(e) => {
                self.state = State::Lost;
                tracing::warn!(resources = %self.resources, error = %e, "lock extension failed");
                Err(e)
            }
        }
    }

    /// Delete the lock from every instance
    ///
    /// Store failures are reported in the [`ReleaseReport`], never as an
    /// error. A second call returns [`ReleaseStatus::AlreadyReleased`].
    pub async fn release(&mut self) -> Result<ReleaseReport> {
        if self.state == State::Released {
            return Ok(ReleaseReport::already_released(
                self.scheduler.coordinator().instance_count(),
            ));
        }
        self.ensure_held()?;

        let report = self
            .scheduler
            .release(self.resources.shared(), &self.token)
            .await;
        self.state = State::Released;

        tracing::info!(
            resources = %self.resources,
            acknowledged = report.acknowledged,
            instances = report.instances,
            "lock released"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("resources", &self.resources)
            .field("token", &self.token)
            .field("ttl", &self.ttl)
            .field("expiration", &self.expiration)
            .field("attempts", &self.attempts)
            .field("status", &self.status())
            .finish()
    }
}

fn unix_millis(at: Instant) -> u64 {
    let remaining = at.saturating_duration_since(Instant::now());
    SystemTime::now()
        .checked_add(remaining)
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::quorum::QuorumCoordinator;
    use crate::settings::LockSettings;
    use crate::store::{LockStore, StoreHandle};

    fn setup(n: usize) -> (RetryScheduler, Vec<Arc<MemoryStore>>) {
        let settings = Arc::new(LockSettings {
            retry_count: 2,
            ..Default::default()
        });
        let stores: Vec<Arc<MemoryStore>> = (0..n)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect();
        let handles = stores
            .iter()
            .enumerate()
            .map(|(index, store)| {
                StoreHandle::new(
                    index,
                    store.clone() as Arc<dyn LockStore>,
                    settings.store_timeout(),
                )
            })
            .collect();
        (
            RetryScheduler::new(QuorumCoordinator::new(handles, settings)),
            stores,
        )
    }

    async fn acquire(scheduler: &RetryScheduler, id: &str, ttl: Duration) -> LockHandle {
        let resources = ResourceSet::single(id).unwrap();
        let grant = scheduler
            .acquire(
                resources.shared(),
                ttl,
                scheduler.settings(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        LockHandle::new(scheduler.clone(), resources, ttl, grant)
    }

    #[test]
    fn test_release_report_status() {
        assert_eq!(ReleaseReport::new(3, 3, vec![]).status, ReleaseStatus::Released);
        assert_eq!(ReleaseReport::new(2, 3, vec![]).status, ReleaseStatus::Partial);
        let none = ReleaseReport::new(0, 3, vec![]);
        assert_eq!(none.status, ReleaseStatus::Unacknowledged);
        assert!(!none.is_acknowledged());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_expires() {
        let (scheduler, _stores) = setup(1);
        let handle = acquire(&scheduler, "lock:001", Duration::from_secs(1)).await;

        assert!(handle.is_valid());
        assert_eq!(handle.remaining(), Duration::from_millis(988));
        assert!(handle.expiration() > 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!handle.is_valid());
        assert_eq!(handle.status(), HandleStatus::Expired);
        assert_eq!(handle.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_supersedes_old_handle() {
        let (scheduler, stores) = setup(3);
        let mut handle = acquire(&scheduler, "lock:001", Duration::from_secs(1)).await;

        let mut extended = handle.extend(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.status(), HandleStatus::Superseded);
        assert_eq!(extended.token(), handle.token());
        assert!(extended.remaining() > Duration::from_secs(4));
        assert!(stores[1].ttl("lock:001").unwrap() > Duration::from_secs(4));

        let err = handle.extend(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            LockError::HandleInvalid(InvalidReason::Superseded)
        ));
        assert!(handle.release().await.is_err());

        assert_eq!(
            extended.release().await.unwrap().status,
            ReleaseStatus::Released
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_fails_when_token_replaced() {
        let (scheduler, stores) = setup(3);
        let mut handle = acquire(&scheduler, "lock:001", Duration::from_secs(1)).await;

        // Two of three instances now hold somebody else's token
        stores[0].put("lock:001", "intruder", Duration::from_secs(10));
        stores[1].put("lock:001", "intruder", Duration::from_secs(10));

        let err = handle.extend(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::QuorumNotAchieved);
        assert_eq!(handle.status(), HandleStatus::Lost);

        let err = handle.release().await.unwrap_err();
        assert!(matches!(err, LockError::HandleInvalid(InvalidReason::Lost)));
        assert_eq!(stores[0].get("lock:001").as_deref(), Some("intruder"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_expired_handle_skips_stores() {
        let (scheduler, stores) = setup(1);
        let mut handle = acquire(&scheduler, "lock:001", Duration::from_millis(100)).await;
        tokio::time::advance(Duration::from_millis(200)).await;

        // Another client takes the key; the expired handle must not touch it
        stores[0].put("lock:001", handle.token().as_str(), Duration::from_secs(10));
        let err = handle.extend(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            LockError::HandleInvalid(InvalidReason::Expired)
        ));
        assert_eq!(stores[0].ttl("lock:001"), Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_release_twice_reports_already_released() {
        let (scheduler, stores) = setup(3);
        let mut handle = acquire(&scheduler, "lock:001", Duration::from_secs(5)).await;

        let first = handle.release().await.unwrap();
        assert_eq!(first.status, ReleaseStatus::Released);
        assert_eq!(first.acknowledged, 3);
        assert!(stores.iter().all(|s| s.is_empty()));

        let second = handle.release().await.unwrap();
        assert_eq!(second.status, ReleaseStatus::AlreadyReleased);
        assert_eq!(handle.status(), HandleStatus::Released);

        let err = handle.extend(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            LockError::HandleInvalid(InvalidReason::Released)
        ));
    }

    #[tokio::test]
    async fn test_release_with_unreachable_instances() {
        let (scheduler, stores) = setup(3);
        let mut handle = acquire(&scheduler, "lock:001", Duration::from_secs(5)).await;
        for store in &stores {
            store.set_available(false);
        }

        let report = handle.release().await.unwrap();
        assert_eq!(report.status, ReleaseStatus::Unacknowledged);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(handle.status(), HandleStatus::Released);
    }
}
