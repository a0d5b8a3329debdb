//! Redis / KeyDB lock store
//!
//! Each lock operation is a single Lua script, so it is atomic on the
//! instance and costs one round trip.

pub mod pool;
pub mod store;

pub use pool::{DEFAULT_PORT, RedisStoreConfig, create_pool, parse_host_port, split_scheme};
pub use store::{ACQUIRE_SCRIPT, EXTEND_SCRIPT, RELEASE_SCRIPT, RedisStore};
