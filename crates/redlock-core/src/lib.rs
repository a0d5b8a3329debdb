//! Redlock Core - quorum-based distributed locks
//!
//! This crate provides:
//! - Parallel quorum rounds over independent key-value store instances
//! - Bounded retries with jittered delays and clock-drift accounting
//! - Lock handles that are retired on extend, release or loss
//! - Background auto-extension with a loss signal
//! - An in-memory store for tests and single-node use
//!
//! Store access goes through the [`LockStore`] trait; a Redis implementation
//! lives in the `redlock-redis` crate.
//!
//! # Safety limits
//!
//! A lock is only as safe as the instance set behind it. An instance that
//! restarts without persistence forgets the keys it held, so a majority can
//! form twice for the same resource. Processes that pause longer than the
//! drift allowance can act on a lock that has already expired elsewhere.
//! Neither case is detected here; deployments that need fencing must add it
//! on the protected resource.

#![allow(clippy::result_large_err)]

pub mod error;
pub mod extension;
pub mod handle;
pub mod memory;
pub mod metrics;
pub mod quorum;
pub mod redlock;
pub mod retry;
pub mod settings;
pub mod store;
pub mod token;

pub use error::{
    ErrorKind, FailureReason, InvalidReason, LockError, QUORUM_FAILURE_MESSAGE, Result,
    StoreFailure,
};
pub use extension::{AutoExtension, ExtensionState, LockSignal};
pub use handle::{HandleStatus, LockHandle, ReleaseReport, ReleaseStatus};
pub use memory::MemoryStore;
pub use quorum::{QuorumCoordinator, Round, Validity, quorum_for};
pub use redlock::Redlock;
pub use retry::{Grant, RetryScheduler};
pub use settings::{AcquireOptions, LockSettings, MAX_TTL};
pub use store::{LockStore, Operation, StoreHandle, StoreReply};
pub use token::{ResourceSet, Token};

pub use tokio_util::sync::CancellationToken;
