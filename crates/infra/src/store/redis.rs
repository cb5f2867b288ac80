//! Redis-backed job store (durable, shared between processes).
//!
//! ## Layout
//!
//! - **Records**: `{prefix}:job:{job_id}`, versioned JSON (see `jobforge_core::codec`)
//! - **Bands**: `{prefix}:queue:{low|normal|high|critical}`, lists of ids
//!   (RPUSH at the tail, LPOP at the head)
//! - **Processing set**: `{prefix}:processing`, sorted set of claimed ids
//!   scored by claim time (unix millis)
//!
//! ## Atomicity
//!
//! - Dequeue pops a band and adds the id to the processing set inside one Lua
//!   script, so no two dispatchers can receive the same id.
//! - `complete`/`fail` first `ZREM` the id from the processing set; only the
//!   caller that actually removed it may write the terminal state.
//! - Putting a stranded id back checks its claim age, removes it and pushes it
//!   onto its band inside one Lua script.
//! - `cancel` first `LREM`s the id from its band; it only wins against a
//!   concurrent dequeue if the id was still there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, instrument, warn};

use jobforge_core::codec;
use jobforge_core::{
    FailOutcome, JobId, JobRecord, JobStatus, NewJob, Priority, QueueError, QueueResult,
};

use super::r#trait::{Claim, JobStore, PendingCounts, QueueStats};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "jobforge";

/// KEYS[1] = processing set, KEYS[2..] = bands, highest priority first.
/// ARGV[1] = claim time in unix millis.
const DEQUEUE_SCRIPT: &str = r"
for i = 2, #KEYS do
  local id = redis.call('LPOP', KEYS[i])
  if id then
    redis.call('ZADD', KEYS[1], ARGV[1], id)
    return id
  end
end
return false
";

/// KEYS[1] = processing set, KEYS[2] = band, ARGV[1] = id,
/// ARGV[2] = newest claim time (unix millis) that may be restored.
const RESTORE_SCRIPT: &str = r"
local claimed = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not claimed or tonumber(claimed) > tonumber(ARGV[2]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
";

/// Key naming for one queue namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn job(&self, job_id: JobId) -> String {
        format!("{}:job:{}", self.prefix, job_id)
    }

    pub fn band(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.prefix, priority.name())
    }

    pub fn processing(&self) -> String {
        format!("{}:processing", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

fn unavailable(err: RedisError) -> QueueError {
    QueueError::unavailable(format!("redis: {err}"))
}

#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    keys: RedisKeys,
    dequeue_script: Script,
    restore_script: Script,
}

impl core::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Key namespace (default: "jobforge")
    pub async fn connect(redis_url: impl AsRef<str>, prefix: Option<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;

        let store = Self {
            conn,
            keys: RedisKeys::new(prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string())),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            restore_script: Script::new(RESTORE_SCRIPT),
        };
        store.ping().await?;
        info!(prefix = %store.keys.prefix, "job queue redis connection established");
        Ok(store)
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    async fn load(&self, conn: &mut ConnectionManager, job_id: JobId) -> QueueResult<Option<JobRecord>> {
        let bytes: Option<Vec<u8>> = conn.get(self.keys.job(job_id)).await.map_err(unavailable)?;
        bytes.map(|b| codec::decode(&b)).transpose()
    }

    async fn save(&self, conn: &mut ConnectionManager, record: &JobRecord) -> QueueResult<()> {
        let bytes = codec::encode(record)?;
        let _: () = conn
            .set(self.keys.job(record.job_id), bytes)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    /// Remove `job_id` from the processing set; true if this caller removed it.
    async fn claim_terminal(&self, conn: &mut ConnectionManager, job_id: JobId) -> QueueResult<bool> {
        let removed: i64 = conn
            .zrem(self.keys.processing(), job_id.to_string())
            .await
            .map_err(unavailable)?;
        Ok(removed == 1)
    }

    /// Give the processing-set slot back after a failed terminal write.
    async fn unclaim(&self, conn: &mut ConnectionManager, job_id: JobId) {
        let restored: Result<i64, _> = conn
            .zadd(self.keys.processing(), job_id.to_string(), Utc::now().timestamp_millis())
            .await;
        if let Err(err) = restored {
            error!(job_id = %job_id, error = %err, "failed to restore processing entry");
        }
    }

    /// Load a running record and win the right to terminalize it.
    async fn take_running(
        &self,
        conn: &mut ConnectionManager,
        job_id: JobId,
        to: JobStatus,
    ) -> QueueResult<JobRecord> {
        let Some(record) = self.load(conn, job_id).await? else {
            return Err(QueueError::NotFound(job_id));
        };
        if !self.claim_terminal(conn, job_id).await? {
            let current = self.load(conn, job_id).await?.map_or(record.status, |r| r.status);
            return Err(QueueError::InvalidTransition {
                job_id,
                from: current,
                to,
            });
        }
        // Re-read after winning the gate so no concurrent write is lost.
        match self.load(conn, job_id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(QueueError::NotFound(job_id)),
            Err(err) => {
                self.unclaim(conn, job_id).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_type = %job.job_type), err)]
    async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        let record = job.into_record(Utc::now())?;
        let bytes = codec::encode(&record)?;
        let mut conn = self.conn.clone();

        let _: () = redis::pipe()
            .atomic()
            .set(self.keys.job(record.job_id), bytes)
            .ignore()
            .rpush(self.keys.band(record.priority), record.job_id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        info!(job_id = %record.job_id, priority = %record.priority, "job queued");
        Ok(record.job_id)
    }

    async fn dequeue(&self, min_priority: Priority) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();

        loop {
            let mut invocation = self.dequeue_script.key(self.keys.processing());
            for priority in Priority::dispatch_order(min_priority) {
                invocation.key(self.keys.band(priority));
            }
            invocation.arg(Utc::now().timestamp_millis());
            let popped: Option<String> = invocation.invoke_async(&mut conn).await.map_err(unavailable)?;

            let Some(raw_id) = popped else {
                return Ok(None);
            };
            let job_id: JobId = match raw_id.parse() {
                Ok(id) => id,
                Err(err) => {
                    warn!(raw_id = %raw_id, error = %err, "dropping malformed id from queue");
                    let _: Result<i64, _> = conn.zrem(self.keys.processing(), &raw_id).await;
                    continue;
                }
            };

            let Some(mut record) = self.load(&mut conn, job_id).await? else {
                warn!(job_id = %job_id, "queued id has no record; dropping");
                self.claim_terminal(&mut conn, job_id).await?;
                continue;
            };
            if let Err(err) = record.mark_running(Utc::now()) {
                warn!(job_id = %job_id, error = %err, "queued id is not dispatchable; dropping");
                self.claim_terminal(&mut conn, job_id).await?;
                continue;
            }
            // If this write fails the id stays in the processing set with a
            // queued record; recovery puts it back in its band.
            self.save(&mut conn, &record).await?;

            debug!(job_id = %job_id, job_type = %record.job_type, "job dequeued");
            return Ok(Some(record));
        }
    }

    async fn complete(&self, job_id: JobId, result: JsonValue) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let mut record = self.take_running(&mut conn, job_id, JobStatus::Completed).await?;

        if let Err(err) = record.mark_completed(result, Utc::now()) {
            self.unclaim(&mut conn, job_id).await;
            return Err(QueueError::from_domain(job_id, err));
        }
        if let Err(err) = self.save(&mut conn, &record).await {
            self.unclaim(&mut conn, job_id).await;
            return Err(err);
        }

        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    async fn fail(&self, job_id: JobId, error: &str) -> QueueResult<FailOutcome> {
        let mut conn = self.conn.clone();
        let mut record = self.take_running(&mut conn, job_id, JobStatus::Failed).await?;

        let outcome = match record.apply_failure(error, Utc::now()) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.unclaim(&mut conn, job_id).await;
                return Err(QueueError::from_domain(job_id, err));
            }
        };

        let written = match outcome {
            FailOutcome::Requeued { .. } => {
                let bytes = codec::encode(&record)?;
                redis::pipe()
                    .atomic()
                    .set(self.keys.job(job_id), bytes)
                    .ignore()
                    .rpush(self.keys.band(record.priority), job_id.to_string())
                    .ignore()
                    .query_async::<_, ()>(&mut conn)
                    .await
                    .map_err(unavailable)
            }
            FailOutcome::Failed => self.save(&mut conn, &record).await,
        };
        if let Err(err) = written {
            self.unclaim(&mut conn, job_id).await;
            return Err(err);
        }

        match outcome {
            FailOutcome::Requeued { retry_count } => warn!(
                job_id = %job_id,
                retry_count,
                max_retries = record.max_retries,
                error,
                "job failed, retrying"
            ),
            FailOutcome::Failed => error!(job_id = %job_id, error, "job failed permanently"),
        }
        Ok(outcome)
    }

    async fn cancel(&self, job_id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let Some(mut record) = self.load(&mut conn, job_id).await? else {
            return Ok(false);
        };
        if record.status != JobStatus::Queued {
            return Ok(false);
        }

        let removed: i64 = conn
            .lrem(self.keys.band(record.priority), 1, job_id.to_string())
            .await
            .map_err(unavailable)?;
        if removed == 0 {
            // A dispatcher popped it first.
            return Ok(false);
        }

        record
            .mark_cancelled(Utc::now())
            .map_err(|e| QueueError::from_domain(job_id, e))?;
        self.save(&mut conn, &record).await?;

        info!(job_id = %job_id, "job cancelled");
        Ok(true)
    }

    async fn get_status(&self, job_id: JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn.clone();
        self.load(&mut conn, job_id).await
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for priority in Priority::ALL {
            pipe.llen(self.keys.band(priority));
        }
        pipe.zcard(self.keys.processing());

        let depths: Vec<usize> = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        let mut pending = PendingCounts::default();
        for (priority, depth) in Priority::ALL.into_iter().zip(depths.iter()) {
            pending.set(priority, *depth);
        }
        let processing = depths.get(Priority::ALL.len()).copied().unwrap_or(0);
        Ok(QueueStats::new(pending, processing))
    }

    async fn processing(&self) -> QueueResult<Vec<Claim>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, f64)> = conn
            .zrange_withscores(self.keys.processing(), 0, -1)
            .await
            .map_err(unavailable)?;

        let mut claims: Vec<Claim> = raw
            .iter()
            .filter_map(|(s, score)| {
                let job_id = match s.parse() {
                    Ok(id) => id,
                    Err(err) => {
                        warn!(raw_id = %s, error = %err, "malformed id in processing set");
                        return None;
                    }
                };
                let claimed_at = DateTime::from_timestamp_millis(*score as i64).unwrap_or_default();
                Some(Claim { job_id, claimed_at })
            })
            .collect();
        claims.sort_by_key(|c| c.job_id);
        Ok(claims)
    }

    async fn forget_processing(&self, job_id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        self.claim_terminal(&mut conn, job_id).await
    }

    async fn restore_stranded(
        &self,
        job_id: JobId,
        claimed_before: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let Some(record) = self.load(&mut conn, job_id).await? else {
            return Ok(false);
        };
        if record.status != JobStatus::Queued {
            return Ok(false);
        }
        let restored: i64 = self
            .restore_script
            .key(self.keys.processing())
            .key(self.keys.band(record.priority))
            .arg(job_id.to_string())
            .arg(claimed_before.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(restored == 1)
    }

    async fn purge(&self, job_id: JobId) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let Some(record) = self.load(&mut conn, job_id).await? else {
            return Ok(false);
        };
        if !record.status.is_terminal() {
            return Ok(false);
        }
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.keys.job(job_id))
            .zrem(self.keys.processing(), job_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
