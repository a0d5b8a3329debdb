//! Redlock Integration Tests
//!
//! Shared support for the scenario tests in `tests/`: logging bootstrap and
//! store fixtures. Redis-backed tests read their endpoints from
//! `REDLOCK_TEST_REDIS` and are ignored by default.

pub mod fixtures;
pub mod logging;

pub use fixtures::{CountingStore, MemoryCluster, eventually, redis_configs_from_env, timed};
pub use logging::{LoggingConfig, init_logging, init_test_logging};
