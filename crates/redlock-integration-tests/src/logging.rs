//! Console logging for test runs
//!
//! Level comes from `RUST_LOG` when set, otherwise from `REDLOCK_LOG_LEVEL`.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Fallback level when `RUST_LOG` is unset
    pub level: Level,
    /// Include the event target (module path)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let level = std::env::var("REDLOCK_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::WARN);
        let with_target = std::env::var("REDLOCK_LOG_TARGET")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);
        Self { level, with_target }
    }
}

/// Install a console subscriber writing through the test harness.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let console_layer = fmt::layer()
        .with_test_writer()
        .with_target(config.with_target)
        .with_filter(filter);

    Registry::default().with(console_layer).try_init().is_ok()
}

/// Idempotent [`init_logging`] with [`LoggingConfig::from_env`]
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        init_logging(&LoggingConfig::from_env());
    });
}
