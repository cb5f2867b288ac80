//! Infrastructure layer: job storage, handler registry, worker pool, config.

pub mod config;
pub mod handlers;
pub mod recovery;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, WorkerConfig};
pub use handlers::{HandlerRegistry, JobHandler};
pub use recovery::{RecoveryConfig, RecoveryMode, RecoveryReport, recover_orphans};
pub use store::{Claim, InMemoryJobStore, JobStore, PendingCounts, QueueStats};
pub use workers::{ExecutorStats, PoolConfig, PoolReport, WorkerPool, WorkerPoolHandle};
