//! Background auto-extension
//!
//! [`AutoExtension`] owns a [`LockHandle`] and extends it whenever its
//! remaining validity drops below the threshold. Release cancels the task and
//! waits for it to hand the handle back before any delete is sent, so no
//! extend can land after a release.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};
use crate::handle::{LockHandle, ReleaseReport};
use crate::metrics;
use crate::token::ResourceSet;

/// Current state of an auto-extended lock
#[derive(Debug, Clone)]
pub enum ExtensionState {
    Active {
        valid_until: Instant,
        expiration: u64,
        extensions: u32,
    },
    /// An extension failed; the lock is no longer held
    Lost(LockError),
    /// The task was stopped by its owner
    Stopped,
}

/// Running auto-extension of one lock
pub struct AutoExtension {
    resources: ResourceSet,
    cancel: CancellationToken,
    task: Option<JoinHandle<LockHandle>>,
    state: watch::Receiver<ExtensionState>,
}

impl AutoExtension {
    /// Start extending `handle` in the background
    ///
    /// The threshold is raised to at least one store timeout so the extend
    /// round can finish before expiry, then capped at half the ttl so each
    /// extension buys time before the next one is due.
    pub fn spawn(handle: LockHandle, threshold: Duration) -> Self {
        let threshold = threshold
            .max(handle.store_timeout())
            .min(handle.ttl() / 2);
        let resources = handle.resources().clone();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ExtensionState::Active {
            valid_until: handle.valid_until(),
            expiration: handle.expiration(),
            extensions: 0,
        });

        metrics::auto_extension_started();
        let task = tokio::spawn(run(handle, threshold, cancel.clone(), state_tx));

        Self {
            resources,
            cancel,
            task: Some(task),
            state: state_rx,
        }
    }

    pub fn resources(&self) -> &ResourceSet {
        &self.resources
    }

    pub fn state(&self) -> ExtensionState {
        self.state.borrow().clone()
    }

    /// Watch for the lock being lost
    pub fn signal(&self) -> LockSignal {
        LockSignal {
            state: self.state.clone(),
        }
    }

    /// Stop extending and hand back the handle, which stays held until it expires
    pub async fn stop(mut self) -> Result<LockHandle> {
        self.shutdown().await
    }

    /// Stop extending, then release the lock
    pub async fn release(mut self) -> Result<ReleaseReport> {
        let mut handle = self.shutdown().await?;
        handle.release().await
    }

    async fn shutdown(&mut self) -> Result<LockHandle> {
        self.cancel.cancel();
        let task = self
            .task
            .take()
            .ok_or_else(|| LockError::ExtensionTask("task already joined".to_string()))?;
        task.await
            .map_err(|e| LockError::ExtensionTask(e.to_string()))
    }
}

impl Drop for AutoExtension {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AutoExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoExtension")
            .field("resources", &self.resources)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn run(
    mut handle: LockHandle,
    threshold: Duration,
    cancel: CancellationToken,
    state: watch::Sender<ExtensionState>,
) -> LockHandle {
    let mut extensions = 0u32;

    loop {
        let wake_at = handle
            .valid_until()
            .checked_sub(threshold)
            .unwrap_or_else(Instant::now);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        let ttl = handle.ttl();
        match handle.extend_with(ttl, &cancel).await {
            Ok(next) => {
                handle = next;
                extensions += 1;
                state.send_replace(ExtensionState::Active {
                    valid_until: handle.valid_until(),
                    expiration: handle.expiration(),
                    extensions,
                });
            }
            Err(LockError::Cancelled { .. }) => break,
            Err(e) => {
                tracing::warn!(
                    resources = %handle.resources(),
                    extensions,
                    error = %e,
                    "auto-extension lost the lock"
                );
                state.send_replace(ExtensionState::Lost(e));
                metrics::auto_extension_stopped();
                return handle;
            }
        }
    }

    state.send_replace(ExtensionState::Stopped);
    metrics::auto_extension_stopped();
    handle
}

/// Read side of an auto-extension, handed to routines run under a lock
#[derive(Debug, Clone)]
pub struct LockSignal {
    state: watch::Receiver<ExtensionState>,
}

impl LockSignal {
    pub fn is_lost(&self) -> bool {
        matches!(*self.state.borrow(), ExtensionState::Lost(_))
    }

    /// Error that ended the lock, if it was lost
    pub fn error(&self) -> Option<LockError> {
        match &*self.state.borrow() {
            ExtensionState::Lost(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Validity left as of the last successful extension
    pub fn remaining(&self) -> Duration {
        match &*self.state.borrow() {
            ExtensionState::Active { valid_until, .. } => {
                valid_until.saturating_duration_since(Instant::now())
            }
            _ => Duration::ZERO,
        }
    }

    /// Resolve once the lock is lost; pending forever if it never is
    pub async fn lost(&self) -> LockError {
        let mut state = self.state.clone();
        let lost = state
            .wait_for(|s| matches!(s, ExtensionState::Lost(_)))
            .await
            .ok()
            .and_then(|s| match &*s {
                ExtensionState::Lost(e) => Some(e.clone()),
                _ => None,
            });
        match lost {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }
}
