//! Background job execution.

pub mod pool;

pub use pool::{ExecutorStats, PoolConfig, PoolReport, WorkerPool, WorkerPoolHandle};
