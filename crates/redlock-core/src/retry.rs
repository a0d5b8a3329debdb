//! Bounded retries around quorum rounds
//!
//! Acquire draws a fresh token for every attempt and rolls back each failed
//! attempt. Extend reuses the handle's token. Release is a single round.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result, StoreFailure};
use crate::handle::ReleaseReport;
use crate::metrics;
use crate::quorum::QuorumCoordinator;
use crate::settings::{LockSettings, MAX_TTL};
use crate::store::Operation;
use crate::token::Token;

/// Successful acquire or extend
#[derive(Debug, Clone)]
pub struct Grant {
    pub token: Token,
    pub valid_until: Instant,
    pub attempts: u32,
}

/// Retries quorum rounds with jittered delays until the attempt budget runs out
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    coordinator: QuorumCoordinator,
}

impl RetryScheduler {
    pub fn new(coordinator: QuorumCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &QuorumCoordinator {
        &self.coordinator
    }

    pub fn settings(&self) -> &LockSettings {
        self.coordinator.settings()
    }

    /// Delay before the next attempt: `retry_delay + random(0..=retry_jitter)`
    pub fn retry_delay(policy: &LockSettings) -> Duration {
        let jitter = if policy.retry_jitter_ms > 0 {
            rand::rng().random_range(0..=policy.retry_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(policy.retry_delay_ms + jitter)
    }

    /// Acquire `keys` for `ttl`
    pub async fn acquire(
        &self,
        keys: Arc<[String]>,
        ttl: Duration,
        policy: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<Grant> {
        self.execute(Operation::Acquire, keys, ttl, None, policy, cancel)
            .await
    }

    /// Reset the expiry of `keys` held with `token` to `ttl`
    pub async fn extend(
        &self,
        keys: Arc<[String]>,
        token: &Token,
        ttl: Duration,
        policy: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<Grant> {
        self.execute(Operation::Extend, keys, ttl, Some(token), policy, cancel)
            .await
    }

    /// Delete `keys` held with `token` on every instance
    pub async fn release(&self, keys: Arc<[String]>, token: &Token) -> ReleaseReport {
        let round = self.coordinator.release(keys, token.clone()).await;
        let report = ReleaseReport::new(
            round.votes_for(),
            self.coordinator.instance_count(),
            round.failures,
        );
        if report.acknowledged == 0 {
            tracing::warn!(
                instances = report.instances,
                "no instance acknowledged the release; keys expire at their ttl"
            );
        }
        report
    }

    async fn execute(
        &self,
        operation: Operation,
        keys: Arc<[String]>,
        ttl: Duration,
        token: Option<&Token>,
        policy: &LockSettings,
        cancel: &CancellationToken,
    ) -> Result<Grant> {
        if ttl > MAX_TTL {
            return Err(LockError::configuration(format!(
                "ttl of {}ms exceeds the maximum of {}ms",
                ttl.as_millis(),
                MAX_TTL.as_millis()
            )));
        }
        let drift = self.settings().drift_allowance(ttl);
        let budget = ttl.checked_sub(drift).filter(|b| !b.is_zero()).ok_or_else(|| {
            LockError::configuration(format!(
                "ttl of {}ms does not exceed the drift allowance of {}ms",
                ttl.as_millis(),
                drift.as_millis()
            ))
        })?;

        let max_attempts = policy.max_attempts();
        let mut achieved = 0;
        let mut last_failures: Vec<StoreFailure> = Vec::new();

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled {
                    attempts: attempt - 1,
                });
            }

            let token = match token {
                Some(token) => token.clone(),
                None => Token::generate(),
            };
            let mut round = self
                .coordinator
                .run(
                    operation,
                    keys.clone(),
                    token.clone(),
                    ttl,
                    Some(budget),
                    cancel,
                )
                .await;

            if let Some(validity) = self.coordinator.decide(&round, ttl) {
                tracing::debug!(
                    operation = operation.as_str(),
                    attempt,
                    remaining_ms = validity.remaining.as_millis() as u64,
                    "quorum achieved"
                );
                return Ok(Grant {
                    token,
                    valid_until: validity.valid_until,
                    attempts: attempt,
                });
            }

            if operation == Operation::Acquire {
                self.coordinator.spawn_rollback(
                    keys.clone(),
                    token,
                    std::mem::take(&mut round.stragglers),
                );
            }
            achieved = achieved.max(round.votes_for());
            last_failures = round.failures;

            if round.cancelled {
                return Err(LockError::Cancelled { attempts: attempt });
            }

            tracing::debug!(
                operation = operation.as_str(),
                attempt,
                max_attempts,
                votes_for = round.accepted.len(),
                quorum = self.coordinator.quorum(),
                "quorum not achieved"
            );

            if attempt < max_attempts {
                let delay = Self::retry_delay(policy);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(LockError::Cancelled { attempts: attempt });
                    }
                }
            }
        }

        metrics::record_quorum_failure(operation);
        tracing::warn!(
            operation = operation.as_str(),
            attempts = max_attempts,
            required = self.coordinator.quorum(),
            achieved,
            instances = self.coordinator.instance_count(),
            "retry window exhausted without quorum"
        );

        Err(LockError::QuorumNotAchieved {
            attempts: max_attempts,
            required: self.coordinator.quorum(),
            achieved,
            instances: self.coordinator.instance_count(),
            failures: last_failures,
        })
    }
}
