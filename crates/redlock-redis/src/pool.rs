//! Redis / KeyDB connection pool creation.
//!
//! Builds a [`fred::clients::Pool`] for one lock instance described by
//! [`RedisStoreConfig`], reading the password from an environment variable.
//! A `rediss://` endpoint or `tls = true` connects over rustls.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::Builder;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use serde::Deserialize;

/// Default Redis port when the endpoint omits one
pub const DEFAULT_PORT: u16 = 6379;

/// One independent lock instance
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// `host`, `host:port`, `redis://host:port` or `rediss://host:port`
    pub endpoint: String,

    /// Connect over TLS; implied by a `rediss://` endpoint (default: false)
    pub tls: bool,

    /// Label used in logs and failure reports, defaults to the endpoint
    pub name: Option<String>,

    /// Name of the environment variable holding the password, if any
    pub password_env: Option<String>,

    /// Connections in the pool (default: 4)
    pub pool_size: usize,

    /// Reconnect backoff ceiling in milliseconds (default: 30000)
    pub reconnect_max_delay_ms: u32,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("127.0.0.1:{}", DEFAULT_PORT),
            tls: false,
            name: None,
            password_env: None,
            pool_size: 4,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl RedisStoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.endpoint.clone())
    }

    pub fn uses_tls(&self) -> bool {
        self.tls || split_scheme(&self.endpoint).0
    }
}

/// Create a connection pool for one instance.
///
/// The pool is connected and verified with `PING` before being returned.
pub async fn create_pool(config: &RedisStoreConfig) -> Result<Pool> {
    let password = config
        .password_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok());

    let (_, endpoint) = split_scheme(&config.endpoint);
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        password,
        ..fred::types::config::Config::default()
    };
    let tls = config.uses_tls();
    if tls {
        fred_config.tls = Some(
            TlsConnector::default_rustls()
                .context("failed to build TLS connector for lock store")?
                .into(),
        );
    }

    let mut builder = Builder::from_config(fred_config);
    builder.set_policy(ReconnectPolicy::new_exponential(
        0,
        100,
        config.reconnect_max_delay_ms,
        2,
    ));

    let pool = builder
        .build_pool(config.pool_size.max(1))
        .context("failed to build lock store connection pool")?;
    pool.init()
        .await
        .with_context(|| format!("failed to connect to lock store {}", config.endpoint))?;

    let _: String = pool
        .ping(None)
        .await
        .context("lock store PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = tls,
        pool_size = config.pool_size,
        "lock store pool created and verified"
    );
    Ok(pool)
}

/// Strip a `redis://` or `rediss://` scheme, reporting whether it asked for TLS
pub fn split_scheme(endpoint: &str) -> (bool, &str) {
    if let Some(rest) = endpoint.strip_prefix("rediss://") {
        (true, rest)
    } else {
        (false, endpoint.strip_prefix("redis://").unwrap_or(endpoint))
    }
}

/// Parse a `host:port` string; the port defaults to 6379.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);
    anyhow::ensure!(!endpoint.is_empty(), "empty lock store endpoint");

    if let Some((host, port)) = endpoint.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, DEFAULT_PORT))
    }
}
