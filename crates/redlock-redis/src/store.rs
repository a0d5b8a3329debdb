use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::LuaInterface;
use redlock_core::LockStore;

use crate::pool::{RedisStoreConfig, create_pool};

/// Set every key to the token if none of them exists.
pub const ACQUIRE_SCRIPT: &str = r#"
    for _, key in ipairs(KEYS) do
        if redis.call('EXISTS', key) == 1 then
            return 0
        end
    end
    for _, key in ipairs(KEYS) do
        redis.call('SET', key, ARGV[1], 'PX', ARGV[2])
    end
    return 1
"#;

/// Reset the expiry of every key if all of them still hold the token.
pub const EXTEND_SCRIPT: &str = r#"
    for _, key in ipairs(KEYS) do
        if redis.call('GET', key) ~= ARGV[1] then
            return 0
        end
    end
    for _, key in ipairs(KEYS) do
        redis.call('PEXPIRE', key, ARGV[2])
    end
    return 1
"#;

/// Delete the keys that hold the token and return how many went.
pub const RELEASE_SCRIPT: &str = r#"
    local count = 0
    for _, key in ipairs(KEYS) do
        if redis.call('GET', key) == ARGV[1] then
            redis.call('DEL', key)
            count = count + 1
        end
    end
    return count
"#;

/// One Redis-compatible lock instance
pub struct RedisStore {
    name: String,
    pool: Pool,
}

impl RedisStore {
    /// Connect to the instance described by `config`
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::from_pool(config.display_name(), pool))
    }

    /// Wrap an already initialised pool
    pub fn from_pool(name: impl Into<String>, pool: Pool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// Connect to every instance, failing on the first unreachable one
    pub async fn connect_all(configs: &[RedisStoreConfig]) -> Result<Vec<Arc<dyn LockStore>>> {
        let mut stores: Vec<Arc<dyn LockStore>> = Vec::with_capacity(configs.len());
        for config in configs {
            stores.push(Arc::new(Self::connect(config).await?));
        }
        Ok(stores)
    }

    async fn eval(&self, script: &str, keys: &[String], args: Vec<String>) -> Result<i64> {
        let result: i64 = self
            .pool
            .eval(script, keys.to_vec(), args)
            .await
            .with_context(|| format!("lock script failed on {}", self.name))?;
        Ok(result)
    }
}

fn ttl_millis(ttl: Duration) -> String {
    // PX and PEXPIRE reject zero
    ttl.as_millis().max(1).to_string()
}

#[async_trait]
impl LockStore for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool> {
        let set = self
            .eval(
                ACQUIRE_SCRIPT,
                keys,
                vec![token.to_string(), ttl_millis(ttl)],
            )
            .await?;
        tracing::trace!(store = %self.name, ?keys, set, "acquire script");
        Ok(set == 1)
    }

    async fn try_extend(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool> {
        let extended = self
            .eval(EXTEND_SCRIPT, keys, vec![token.to_string(), ttl_millis(ttl)])
            .await?;
        tracing::trace!(store = %self.name, ?keys, extended, "extend script");
        Ok(extended == 1)
    }

    async fn try_delete(&self, keys: &[String], token: &str) -> Result<u64> {
        let deleted = self
            .eval(RELEASE_SCRIPT, keys, vec![token.to_string()])
            .await?;
        tracing::trace!(store = %self.name, ?keys, deleted, "release script");
        Ok(deleted.max(0) as u64)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::from_millis(1500)), "1500");
        assert_eq!(ttl_millis(Duration::ZERO), "1");
    }

    #[test]
    fn test_scripts_check_before_write() {
        let exists = ACQUIRE_SCRIPT.find("EXISTS").unwrap();
        let set = ACQUIRE_SCRIPT.find("'SET'").unwrap();
        assert!(exists < set);

        let get = EXTEND_SCRIPT.find("GET").unwrap();
        let expire = EXTEND_SCRIPT.find("PEXPIRE").unwrap();
        assert!(get < expire);

        assert!(RELEASE_SCRIPT.contains("== ARGV[1]"));
    }
}
