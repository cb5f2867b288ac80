//! `jobforge-core`: job queue building blocks.
//!
//! This crate contains the **pure** job model: records, priority bands, the
//! status state machine, the retry rule and the record codec. Storage and
//! execution live in `jobforge-infra`.

pub mod codec;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{DomainError, DomainResult, QueueError, QueueResult};
pub use id::JobId;
pub use job::{
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS, JobRecord, JobStatus, MAX_TIMEOUT_SECONDS, NewJob,
    Priority,
};
pub use retry::{BackoffStrategy, FailOutcome, RetryPolicy};
