use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobforge_core::{FailOutcome, JobId, JobRecord, NewJob, Priority, QueueResult};

/// Pending depth of each priority band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub critical: usize,
}

impl PendingCounts {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Low => self.low,
            Priority::Normal => self.normal,
            Priority::High => self.high,
            Priority::Critical => self.critical,
        }
    }

    pub fn set(&mut self, priority: Priority, depth: usize) {
        match priority {
            Priority::Low => self.low = depth,
            Priority::Normal => self.normal = depth,
            Priority::High => self.high = depth,
            Priority::Critical => self.critical = depth,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.normal + self.high + self.critical
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: PendingCounts,
    pub total_pending: usize,
    pub processing: usize,
}

impl QueueStats {
    pub fn new(pending: PendingCounts, processing: usize) -> Self {
        Self {
            pending,
            total_pending: pending.total(),
            processing,
        }
    }
}

/// One processing-set entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub job_id: JobId,
    /// When a dispatcher popped the id from its band
    pub claimed_at: DateTime<Utc>,
}

/// Durable, priority-partitioned job queue.
///
/// A store keeps three things:
///
/// - a keyed record store addressed by `job_id`;
/// - one FIFO list of ids per priority band;
/// - the set of claimed ids with their claim time (crash-recovery bookkeeping).
///
/// ## Implementation Requirements
///
/// - `dequeue` is atomic with respect to the band pop: two concurrent callers
///   never receive the same job.
/// - `complete`/`fail` only succeed for a job that is `running`; a second call
///   is rejected and never overwrites the record.
/// - `cancel` and `dequeue` cannot both win the same job.
/// - Connectivity problems surface as `QueueError::Unavailable`; no job is
///   silently dropped or silently created.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `queued` record and append it to the tail of its band.
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId>;

    /// Pop the head of the highest non-empty band at or above `min_priority`
    /// and mark it `running`.
    ///
    /// Callers wanting the conventional default pass `Priority::default()`
    /// (`normal`).
    async fn dequeue(&self, min_priority: Priority) -> QueueResult<Option<JobRecord>>;

    /// `running -> completed` with the handler's result.
    async fn complete(&self, job_id: JobId, result: JsonValue) -> QueueResult<()>;

    /// Record a failed attempt; the retry rule decides requeue vs final failure.
    async fn fail(&self, job_id: JobId, error: &str) -> QueueResult<FailOutcome>;

    /// Cancel a `queued` job. `Ok(false)` if it is running, terminal or unknown.
    async fn cancel(&self, job_id: JobId) -> QueueResult<bool>;

    async fn get_status(&self, job_id: JobId) -> QueueResult<Option<JobRecord>>;

    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Snapshot of the processing set, ordered by id.
    async fn processing(&self) -> QueueResult<Vec<Claim>>;

    /// Drop an id from the processing set without touching any record.
    ///
    /// Used by recovery for ids whose record is gone or already terminal.
    async fn forget_processing(&self, job_id: JobId) -> QueueResult<bool>;

    /// Put back a job that left its band but never reached `running`
    /// (the dispatcher died between the pop and the status write).
    ///
    /// Only claims made at or before `claimed_before` are restored; a younger
    /// claim may still belong to a live dispatcher about to write `running`.
    async fn restore_stranded(
        &self,
        job_id: JobId,
        claimed_before: DateTime<Utc>,
    ) -> QueueResult<bool>;

    /// Delete a terminal record and any claim left for it. Queued and running
    /// records are kept.
    async fn purge(&self, job_id: JobId) -> QueueResult<bool>;

    /// Connectivity check.
    async fn ping(&self) -> QueueResult<()>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        (**self).enqueue(job).await
    }

    async fn dequeue(&self, min_priority: Priority) -> QueueResult<Option<JobRecord>> {
        (**self).dequeue(min_priority).await
    }

    async fn complete(&self, job_id: JobId, result: JsonValue) -> QueueResult<()> {
        (**self).complete(job_id, result).await
    }

    async fn fail(&self, job_id: JobId, error: &str) -> QueueResult<FailOutcome> {
        (**self).fail(job_id, error).await
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        (**self).cancel(job_id).await
    }

    async fn get_status(&self, job_id: JobId) -> QueueResult<Option<JobRecord>> {
        (**self).get_status(job_id).await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        (**self).stats().await
    }

    async fn processing(&self) -> QueueResult<Vec<Claim>> {
        (**self).processing().await
    }

    async fn forget_processing(&self, job_id: JobId) -> QueueResult<bool> {
        (**self).forget_processing(job_id).await
    }

    async fn restore_stranded(
        &self,
        job_id: JobId,
        claimed_before: DateTime<Utc>,
    ) -> QueueResult<bool> {
        (**self).restore_stranded(job_id, claimed_before).await
    }

    async fn purge(&self, job_id: JobId) -> QueueResult<bool> {
        (**self).purge(job_id).await
    }

    async fn ping(&self) -> QueueResult<()> {
        (**self).ping().await
    }
}
