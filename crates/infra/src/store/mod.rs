//! Job storage: trait plus in-memory and Redis backends.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryJobStore;
#[cfg(feature = "redis")]
pub use redis::{DEFAULT_KEY_PREFIX, RedisJobStore, RedisKeys};
pub use r#trait::{Claim, JobStore, PendingCounts, QueueStats};
