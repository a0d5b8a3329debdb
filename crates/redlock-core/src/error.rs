//! Error types for lock operations
//!
//! Only aggregate outcomes reach the caller. Individual store failures are
//! recorded as [`StoreFailure`] entries inside [`LockError::QuorumNotAchieved`]
//! or a [`crate::ReleaseReport`], never as errors of their own.

use std::fmt::{Display, Formatter};

use serde::Serialize;

/// Message used by every quorum failure, kept stable for callers that match on it.
pub const QUORUM_FAILURE_MESSAGE: &str =
    "The operation was unable to achieve a quorum during its retry window.";

/// Result alias for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

/// Caller-visible lock errors
#[derive(thiserror::Error, Debug, Clone)]
pub enum LockError {
    #[error(
        "{message} attempts: {attempts}, instances required: {required}, \
         achieved: {achieved} of {instances}",
        message = QUORUM_FAILURE_MESSAGE
    )]
    QuorumNotAchieved {
        attempts: u32,
        required: usize,
        achieved: usize,
        instances: usize,
        failures: Vec<StoreFailure>,
    },

    #[error("lock handle is no longer valid: {0}")]
    HandleInvalid(InvalidReason),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("lock operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("auto-extension task failed: {0}")]
    ExtensionTask(String),
}

impl LockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LockError::QuorumNotAchieved { .. } => ErrorKind::QuorumNotAchieved,
            LockError::HandleInvalid(_) => ErrorKind::HandleInvalid,
            LockError::Configuration(_) => ErrorKind::Configuration,
            LockError::Cancelled { .. } => ErrorKind::Cancelled,
            LockError::ExtensionTask(_) => ErrorKind::ExtensionTask,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        LockError::Configuration(message.into())
    }

    /// Whether this is a contention or availability failure rather than misuse
    pub fn is_quorum_failure(&self) -> bool {
        matches!(self, LockError::QuorumNotAchieved { .. })
    }

    /// Per-store failures of the last attempt, empty for other kinds
    pub fn store_failures(&self) -> &[StoreFailure] {
        match self {
            LockError::QuorumNotAchieved { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// Stable discriminator for [`LockError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QuorumNotAchieved,
    HandleInvalid,
    Configuration,
    Cancelled,
    ExtensionTask,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::QuorumNotAchieved => "quorum_not_achieved",
            ErrorKind::HandleInvalid => "handle_invalid",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ExtensionTask => "extension_task",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a handle can no longer be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    /// `release()` already ran on this handle
    Released,
    /// The validity window elapsed
    Expired,
    /// A successful `extend()` produced a newer handle
    Superseded,
    /// An `extend()` failed to re-achieve quorum
    Lost,
}

impl Display for InvalidReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            InvalidReason::Released => "lock was already released",
            InvalidReason::Expired => "lock has already expired",
            InvalidReason::Superseded => "lock was extended, use the handle returned by extend()",
            InvalidReason::Lost => "lock was lost after a failed extension",
        };
        f.write_str(text)
    }
}

/// Failure of one store instance during one quorum round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub instance: usize,
    pub store: String,
    pub reason: FailureReason,
}

impl Display for StoreFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}: {}", self.instance, self.store, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The store answered "no": key held by another token, or token mismatch
    Rejected,
    /// No answer within the per-call timeout
    TimedOut,
    /// No answer before the round's validity budget ran out
    Unanswered,
    /// Connection or protocol error
    Unavailable(String),
    /// The call was aborted by cancellation
    Cancelled,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Rejected => f.write_str("rejected"),
            FailureReason::TimedOut => f.write_str("timed out"),
            FailureReason::Unanswered => f.write_str("no answer within the validity budget"),
            FailureReason::Unavailable(reason) => write!(f, "unavailable ({})", reason),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}
