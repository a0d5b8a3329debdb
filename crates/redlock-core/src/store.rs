//! Store capability and per-instance handles
//!
//! [`LockStore`] is what a key-value client must provide: three conditional
//! operations, each atomic on its own instance. [`StoreHandle`] wraps one
//! instance with the per-call timeout and turns every outcome, including
//! errors, into a [`StoreReply`] for quorum accounting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FailureReason;
use crate::token::Token;

/// Conditional operations on one independent key-value store instance
///
/// Every method must be atomic on the instance (a single round trip, no
/// read-then-write race). `keys` is the full resource set; the operation
/// applies to all of them or none.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Instance label used in logs and failure reports
    fn name(&self) -> &str;

    /// Set every key to `token` with expiry `ttl` if none of them exists
    async fn try_set(&self, keys: &[String], token: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Reset the expiry of every key to `ttl` if all of them hold `token`
    async fn try_extend(&self, keys: &[String], token: &str, ttl: Duration)
    -> anyhow::Result<bool>;

    /// Delete the keys that hold `token`, returning how many were removed
    async fn try_delete(&self, keys: &[String], token: &str) -> anyhow::Result<u64>;
}

/// Kind of quorum operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Acquire,
    Extend,
    Release,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Acquire => "acquire",
            Operation::Extend => "extend",
            Operation::Release => "release",
        }
    }
}

/// Outcome of one store call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Accepted,
    Failed(FailureReason),
}

impl StoreReply {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StoreReply::Accepted)
    }
}

/// One configured store instance together with its call timeout
#[derive(Clone)]
pub struct StoreHandle {
    index: usize,
    store: Arc<dyn LockStore>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(index: usize, store: Arc<dyn LockStore>, timeout: Duration) -> Self {
        Self {
            index,
            store,
            timeout,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Run one operation against this instance
    ///
    /// Errors and timeouts count as "no"; they never count as "yes".
    pub async fn call(
        &self,
        operation: Operation,
        keys: &[String],
        token: &Token,
        ttl: Duration,
    ) -> StoreReply {
        let call = async {
            match operation {
                Operation::Acquire => self.store.try_set(keys, token.as_str(), ttl).await,
                Operation::Extend => self.store.try_extend(keys, token.as_str(), ttl).await,
                Operation::Release => self
                    .store
                    .try_delete(keys, token.as_str())
                    .await
                    .map(|deleted| deleted > 0),
            }
        };

        let reply = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(true)) => StoreReply::Accepted,
            Ok(Ok(false)) => StoreReply::Failed(FailureReason::Rejected),
            Ok(Err(e)) => StoreReply::Failed(FailureReason::Unavailable(e.to_string())),
            Err(_) => StoreReply::Failed(FailureReason::TimedOut),
        };

        tracing::debug!(
            store = self.name(),
            instance = self.index,
            operation = operation.as_str(),
            ?reply,
            "store reply"
        );
        reply
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
