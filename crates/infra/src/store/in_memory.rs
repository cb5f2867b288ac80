use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use jobforge_core::{
    FailOutcome, JobId, JobRecord, JobStatus, NewJob, Priority, QueueError, QueueResult,
};

use super::r#trait::{Claim, JobStore, PendingCounts, QueueStats};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<JobId, JobRecord>,
    /// One FIFO per band, indexed by `band_index`.
    bands: [VecDeque<JobId>; 4],
    /// Claimed ids and when they were claimed
    processing: HashMap<JobId, DateTime<Utc>>,
}

fn band_index(priority: Priority) -> usize {
    usize::from(priority.as_u8()) - 1
}

/// In-memory job store for tests/dev.
///
/// A single mutex guards records, bands and the processing set together, so
/// every operation is atomic. Nothing survives the process.
#[derive(Debug)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate the backing store going away (and coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Leave `job_id` the way a dispatcher that died mid-claim would: gone
    /// from its band, present in the processing set, record still `queued`.
    #[cfg(test)]
    pub(crate) fn strand(&self, job_id: JobId, claimed_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        for band in inner.bands.iter_mut() {
            band.retain(|id| *id != job_id);
        }
        inner.processing.insert(job_id, claimed_at);
    }

    /// Drop a record while leaving its id in the processing set.
    #[cfg(test)]
    pub(crate) fn lose_record(&self, job_id: JobId) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(&job_id);
        inner.processing.insert(job_id, Utc::now());
    }

    /// Rewrite a stored record in place, bypassing request validation.
    #[cfg(test)]
    pub(crate) fn edit_record(&self, job_id: JobId, edit: impl FnOnce(&mut JobRecord)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(record) = inner.records.get_mut(&job_id) {
            edit(record);
        }
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, Inner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::unavailable("in-memory store marked unavailable"));
        }
        self.inner
            .lock()
            .map_err(|_| QueueError::unavailable("lock poisoned"))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        let record = job.into_record(Utc::now())?;
        let id = record.job_id;
        let priority = record.priority;

        let mut inner = self.lock()?;
        inner.records.insert(id, record);
        inner.bands[band_index(priority)].push_back(id);

        info!(job_id = %id, priority = %priority, "job queued");
        Ok(id)
    }

    async fn dequeue(&self, min_priority: Priority) -> QueueResult<Option<JobRecord>> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        for priority in Priority::dispatch_order(min_priority) {
            while let Some(id) = inner.bands[band_index(priority)].pop_front() {
                let Some(record) = inner.records.get_mut(&id) else {
                    warn!(job_id = %id, "queued id has no record; dropping");
                    continue;
                };
                if let Err(err) = record.mark_running(now) {
                    warn!(job_id = %id, error = %err, "queued id is not dispatchable; dropping");
                    continue;
                }
                let record = record.clone();
                inner.processing.insert(id, now);

                debug!(job_id = %id, job_type = %record.job_type, "job dequeued");
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    async fn complete(&self, job_id: JobId, result: JsonValue) -> QueueResult<()> {
        let mut inner = self.lock()?;
        let record = inner
            .records
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        record
            .mark_completed(result, Utc::now())
            .map_err(|e| QueueError::from_domain(job_id, e))?;
        inner.processing.remove(&job_id);

        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: &str) -> QueueResult<FailOutcome> {
        let mut inner = self.lock()?;
        let record = inner
            .records
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?;

        let outcome = record
            .apply_failure(error, Utc::now())
            .map_err(|e| QueueError::from_domain(job_id, e))?;
        let priority = record.priority;
        let max_retries = record.max_retries;

        inner.processing.remove(&job_id);
        match outcome {
            FailOutcome::Requeued { retry_count } => {
                inner.bands[band_index(priority)].push_back(job_id);
                warn!(job_id = %job_id, retry_count, max_retries, error, "job failed, retrying");
            }
            FailOutcome::Failed => {
                tracing::error!(job_id = %job_id, error, "job failed permanently");
            }
        }
        Ok(outcome)
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        let Some(record) = inner.records.get_mut(&job_id) else {
            return Ok(false);
        };
        if record.status != JobStatus::Queued {
            return Ok(false);
        }

        record
            .mark_cancelled(Utc::now())
            .map_err(|e| QueueError::from_domain(job_id, e))?;
        let priority = record.priority;
        inner.bands[band_index(priority)].retain(|id| *id != job_id);

        info!(job_id = %job_id, "job cancelled");
        Ok(true)
    }

    async fn get_status(&self, job_id: JobId) -> QueueResult<Option<JobRecord>> {
        let inner = self.lock()?;
        Ok(inner.records.get(&job_id).cloned())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let inner = self.lock()?;
        let mut pending = PendingCounts::default();
        for priority in Priority::ALL {
            pending.set(priority, inner.bands[band_index(priority)].len());
        }
        Ok(QueueStats::new(pending, inner.processing.len()))
    }

    async fn processing(&self) -> QueueResult<Vec<Claim>> {
        let inner = self.lock()?;
        let mut claims: Vec<_> = inner
            .processing
            .iter()
            .map(|(&job_id, &claimed_at)| Claim { job_id, claimed_at })
            .collect();
        claims.sort_by_key(|c| c.job_id);
        Ok(claims)
    }

    async fn forget_processing(&self, job_id: JobId) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner.processing.remove(&job_id).is_some())
    }

    async fn restore_stranded(
        &self,
        job_id: JobId,
        claimed_before: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        let Some(priority) = inner
            .records
            .get(&job_id)
            .filter(|r| r.status == JobStatus::Queued)
            .map(|r| r.priority)
        else {
            return Ok(false);
        };
        match inner.processing.get(&job_id) {
            Some(claimed_at) if *claimed_at <= claimed_before => {
                inner.processing.remove(&job_id);
            }
            _ => return Ok(false),
        }
        let band = &mut inner.bands[band_index(priority)];
        if !band.contains(&job_id) {
            band.push_back(job_id);
        }
        Ok(true)
    }

    async fn purge(&self, job_id: JobId) -> QueueResult<bool> {
        let mut inner = self.lock()?;
        match inner.records.get(&job_id) {
            Some(record) if record.status.is_terminal() => {
                inner.records.remove(&job_id);
                inner.processing.remove(&job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> QueueResult<()> {
        self.lock().map(|_| ())
    }
}
