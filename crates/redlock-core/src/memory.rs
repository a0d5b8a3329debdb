//! In-memory lock store
//!
//! A single-process [`LockStore`] with per-key expiry on the tokio clock.
//! Used for tests and single-node deployments, and able to simulate an
//! unavailable or slow instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::store::LockStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory store with TTL semantics matching `SET NX PX`
pub struct MemoryStore {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make every call fail as if the connection were down
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it touches the data
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Live value of a key
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Remaining time to live of a key
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Overwrite a key unconditionally, as another client would after expiry
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries.lock().insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove a key unconditionally
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn enter(&self) -> anyhow::Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("store '{}' is unavailable", self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set(&self, keys: &[String], token: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.enter().await?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        if keys
            .iter()
            .any(|key| entries.get(key).is_some_and(|entry| entry.is_live(now)))
        {
            return Ok(false);
        }

        let expires_at = now + ttl;
        for key in keys {
            entries.insert(
                key.clone(),
                Entry {
                    value: token.to_string(),
                    expires_at,
                },
            );
        }
        Ok(true)
    }

    async fn try_extend(
        &self,
        keys: &[String],
        token: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        self.enter().await?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let owned = keys.iter().all(|key| {
            entries
                .get(key)
                .is_some_and(|entry| entry.is_live(now) && entry.value == token)
        });
        if !owned {
            return Ok(false);
        }

        let expires_at = now + ttl;
        for key in keys {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = expires_at;
            }
        }
        Ok(true)
    }

    async fn try_delete(&self, keys: &[String], token: &str) -> anyhow::Result<u64> {
        self.enter().await?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut deleted = 0;
        for key in keys {
            let owned = entries
                .get(key)
                .is_some_and(|entry| entry.is_live(now) && entry.value == token);
            if owned {
                entries.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}
