//! Quorum rounds across all store instances
//!
//! One round issues the same conditional operation to every instance in
//! parallel and collects replies until all have answered, the validity budget
//! runs out, or the caller cancels. Unanswered calls count as failures; they
//! keep running in the background and are awaited by a rollback, if any,
//! before it issues its deletes.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{FailureReason, StoreFailure};
use crate::metrics;
use crate::settings::LockSettings;
use crate::store::{Operation, StoreHandle, StoreReply};
use crate::token::Token;

/// Majority of `instances`: `floor(n / 2) + 1`
pub fn quorum_for(instances: usize) -> usize {
    instances / 2 + 1
}

/// Result of one round
#[derive(Debug)]
pub struct Round {
    pub operation: Operation,
    pub started_at: Instant,
    pub elapsed: Duration,
    /// Indexes of the instances that accepted
    pub accepted: Vec<usize>,
    pub failures: Vec<StoreFailure>,
    pub cancelled: bool,
    /// Calls still in flight when the budget ran out
    pub(crate) stragglers: Vec<JoinHandle<StoreReply>>,
}

impl Round {
    pub fn votes_for(&self) -> usize {
        self.accepted.len()
    }

    pub fn votes_against(&self) -> usize {
        self.failures.len()
    }
}

/// Validity granted by a successful acquire or extend round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub valid_until: Instant,
    pub remaining: Duration,
}

/// Runs rounds over the fixed set of store instances
#[derive(Clone)]
pub struct QuorumCoordinator {
    stores: Arc<[StoreHandle]>,
    quorum: usize,
    settings: Arc<LockSettings>,
}

impl QuorumCoordinator {
    pub fn new(stores: Vec<StoreHandle>, settings: Arc<LockSettings>) -> Self {
        let quorum = quorum_for(stores.len());
        Self {
            stores: stores.into(),
            quorum,
            settings,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn instance_count(&self) -> usize {
        self.stores.len()
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Issue `operation` to every instance in parallel
    ///
    /// With a `budget`, stops waiting once it elapses and reports the silent
    /// instances as [`FailureReason::Unanswered`]. On cancellation, aborts the
    /// outstanding calls and reports them as [`FailureReason::Cancelled`].
    /// Either way their handles are returned as stragglers.
    ///
    /// Dropping an acquire round before it finishes rolls it back once the
    /// calls still in flight have settled.
    pub async fn run(
        &self,
        operation: Operation,
        keys: Arc<[String]>,
        token: Token,
        ttl: Duration,
        budget: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Round {
        let started_at = Instant::now();
        let deadline = budget.and_then(|budget| started_at.checked_add(budget));

        let tasks: Vec<JoinHandle<StoreReply>> = self
            .stores
            .iter()
            .map(|store| {
                let store = store.clone();
                let keys = keys.clone();
                let token = token.clone();
                tokio::spawn(async move { store.call(operation, &keys, &token, ttl).await })
            })
            .collect();
        let mut calls = RoundCalls {
            replies: vec![None; tasks.len()],
            tasks,
            rollback: (operation == Operation::Acquire)
                .then(|| (self.clone(), keys.clone(), token.clone())),
        };

        let mut cancelled = false;
        {
            // Polled by reference so unanswered handles survive as stragglers
            let replies = &mut calls.replies;
            let mut inflight: FuturesUnordered<_> = calls
                .tasks
                .iter_mut()
                .enumerate()
                .map(|(index, task)| async move { (index, task.await) })
                .collect();

            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(expiry);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = &mut expiry => break,
                    next = inflight.next() => match next {
                        Some((index, Ok(reply))) => replies[index] = Some(reply),
                        Some((index, Err(e))) => {
                            replies[index] = Some(StoreReply::Failed(FailureReason::Unavailable(
                                format!("store task failed: {}", e),
                            )));
                        }
                        None => break,
                    },
                }
            }
        }
        let (replies, tasks) = calls.finish();

        let elapsed = started_at.elapsed();
        let mut accepted = Vec::new();
        let mut failures = Vec::new();
        let mut stragglers = Vec::new();
        for (store, (reply, task)) in self
            .stores
            .iter()
            .zip(replies.into_iter().zip(tasks.into_iter()))
        {
            let reason = match reply {
                Some(StoreReply::Accepted) => {
                    accepted.push(store.index());
                    continue;
                }
                Some(StoreReply::Failed(reason)) => reason,
                None if cancelled => {
                    task.abort();
                    stragglers.push(task);
                    FailureReason::Cancelled
                }
                None => {
                    stragglers.push(task);
                    FailureReason::Unanswered
                }
            };
            failures.push(StoreFailure {
                instance: store.index(),
                store: store.name().to_string(),
                reason,
            });
        }

        tracing::debug!(
            operation = operation.as_str(),
            votes_for = accepted.len(),
            votes_against = failures.len(),
            quorum = self.quorum,
            elapsed_ms = elapsed.as_millis() as u64,
            cancelled,
            "quorum round finished"
        );

        Round {
            operation,
            started_at,
            elapsed,
            accepted,
            failures,
            cancelled,
            stragglers,
        }
    }

    /// Decide an acquire or extend round
    ///
    /// Succeeds when a majority accepted and time is left after subtracting
    /// the elapsed time and the drift allowance from the ttl. The lock is
    /// valid until `started_at + ttl - elapsed - drift`.
    pub fn decide(&self, round: &Round, ttl: Duration) -> Option<Validity> {
        let drift = self.settings.drift_allowance(ttl);
        let granted = round.votes_for() >= self.quorum && !round.cancelled;
        let remaining = ttl.checked_sub(round.elapsed).and_then(|t| t.checked_sub(drift));

        let validity = match (granted, remaining) {
            (true, Some(remaining)) if !remaining.is_zero() => {
                round.started_at.checked_add(remaining).map(|valid_until| Validity {
                    valid_until,
                    remaining,
                })
            }
            (true, _) => {
                tracing::warn!(
                    operation = round.operation.as_str(),
                    elapsed_ms = round.elapsed.as_millis() as u64,
                    ttl_ms = ttl.as_millis() as u64,
                    drift_ms = drift.as_millis() as u64,
                    "quorum reached after the validity window closed"
                );
                None
            }
            (false, _) => None,
        };

        metrics::record_round(round.operation, validity.is_some(), round.elapsed);
        validity
    }

    /// Conditionally delete `token` from every instance, waiting for all replies
    pub async fn release(&self, keys: Arc<[String]>, token: Token) -> Round {
        let round = self
            .run(
                Operation::Release,
                keys,
                token,
                Duration::ZERO,
                None,
                &CancellationToken::new(),
            )
            .await;
        metrics::record_round(Operation::Release, round.votes_for() > 0, round.elapsed);
        round
    }

    /// Best-effort compensating delete after a failed acquire
    ///
    /// Runs in the background. Waits for `stragglers` first so a late
    /// `SET` cannot land after the delete.
    pub fn spawn_rollback(
        &self,
        keys: Arc<[String]>,
        token: Token,
        stragglers: Vec<JoinHandle<StoreReply>>,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime available, skipping lock rollback");
            return;
        };

        let coordinator = self.clone();
        runtime.spawn(async move {
            for straggler in stragglers {
                let _ = straggler.await;
            }
            let round = coordinator.release(keys, token).await;
            let unacknowledged = round
                .failures
                .iter()
                .filter(|failure| failure.reason != FailureReason::Rejected)
                .count();
            if unacknowledged > 0 {
                tracing::warn!(
                    unacknowledged,
                    failures = ?round.failures,
                    "lock rollback did not reach every instance"
                );
            } else {
                tracing::debug!(deleted = round.votes_for(), "lock rollback finished");
            }
            metrics::record_rollback(unacknowledged);
        });
    }
}

impl std::fmt::Debug for QuorumCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumCoordinator")
            .field("stores", &self.stores)
            .field("quorum", &self.quorum)
            .finish()
    }
}

/// Store calls of one round
///
/// Rolls an acquire round back when dropped before [`RoundCalls::finish`],
/// handing the unanswered calls to the rollback so their writes land first.
struct RoundCalls {
    tasks: Vec<JoinHandle<StoreReply>>,
    replies: Vec<Option<StoreReply>>,
    rollback: Option<(QuorumCoordinator, Arc<[String]>, Token)>,
}

impl RoundCalls {
    fn finish(&mut self) -> (Vec<Option<StoreReply>>, Vec<JoinHandle<StoreReply>>) {
        self.rollback = None;
        (
            std::mem::take(&mut self.replies),
            std::mem::take(&mut self.tasks),
        )
    }
}

impl Drop for RoundCalls {
    fn drop(&mut self) {
        let Some((coordinator, keys, token)) = self.rollback.take() else {
            return;
        };
        // Answered handles are already complete and must not be polled again
        let pending = std::mem::take(&mut self.tasks)
            .into_iter()
            .zip(self.replies.iter())
            .filter(|(_, reply)| reply.is_none())
            .map(|(task, _)| task)
            .collect();
        tracing::debug!("acquire round dropped in flight, rolling back");
        coordinator.spawn_rollback(keys, token, pending);
    }
}
