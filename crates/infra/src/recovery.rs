//! Orphan recovery.
//!
//! A job stays `running` forever if the worker executing it dies. The sweep
//! walks the processing set and finds:
//!
//! - orphans: `running` past `timeout + grace`;
//! - stranded ids: claimed from a band more than `grace` ago but never
//!   marked `running`;
//! - dangling ids: no record at all, or a record that is already terminal.
//!
//! `Audit` only reports and writes nothing. `Requeue` feeds orphans through
//! the normal failure path (so the retry bound still applies) and repairs the
//! bookkeeping.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jobforge_core::{FailOutcome, JobId, JobStatus, QueueError, QueueResult};

use crate::store::{Claim, JobStore};

/// Error recorded on a job reclaimed from a dead worker.
pub const WORKER_LOST_ERROR: &str = "worker lost before completion";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Report orphans, change nothing.
    #[default]
    Audit,
    /// Fail orphans through the retry rule and repair the processing set.
    Requeue,
    /// Never sweep.
    Disabled,
}

impl FromStr for RecoveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audit" => Ok(Self::Audit),
            "requeue" => Ok(Self::Requeue),
            "disabled" | "off" | "none" => Ok(Self::Disabled),
            other => Err(format!("unknown recovery mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub mode: RecoveryMode,
    /// Time between sweeps of a running pool
    pub interval: Duration,
    /// Slack past a job's own timeout before it counts as orphaned
    pub grace: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::Audit,
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(30),
        }
    }
}

impl RecoveryConfig {
    pub fn disabled() -> Self {
        Self {
            mode: RecoveryMode::Disabled,
            ..Self::default()
        }
    }

    pub fn requeue() -> Self {
        Self {
            mode: RecoveryMode::Requeue,
            ..Self::default()
        }
    }
}

/// What one sweep found (and, in `Requeue` mode, did).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub orphaned: Vec<JobId>,
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub stranded: Vec<JobId>,
    pub dangling: Vec<JobId>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty() && self.stranded.is_empty() && self.dangling.is_empty()
    }
}

/// Sweep the processing set once.
pub async fn recover_orphans<S>(store: &S, config: &RecoveryConfig) -> QueueResult<RecoveryReport>
where
    S: JobStore + ?Sized,
{
    recover_orphans_at(store, config, Utc::now()).await
}

pub(crate) async fn recover_orphans_at<S>(
    store: &S,
    config: &RecoveryConfig,
    now: DateTime<Utc>,
) -> QueueResult<RecoveryReport>
where
    S: JobStore + ?Sized,
{
    let mut report = RecoveryReport::default();
    if config.mode == RecoveryMode::Disabled {
        return Ok(report);
    }
    let repair = config.mode == RecoveryMode::Requeue;
    let grace = chrono::Duration::from_std(config.grace).unwrap_or(chrono::Duration::MAX);
    let claimed_before = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);

    for Claim { job_id, claimed_at } in store.processing().await? {
        let record = store.get_status(job_id).await?;
        match record {
            None => {
                warn!(job_id = %job_id, "processing id has no record");
                report.dangling.push(job_id);
                if repair {
                    store.forget_processing(job_id).await?;
                }
            }
            Some(record) if record.status.is_terminal() => {
                warn!(job_id = %job_id, status = %record.status, "terminal job left in processing set");
                report.dangling.push(job_id);
                if repair {
                    store.forget_processing(job_id).await?;
                }
            }
            Some(record) if record.status == JobStatus::Queued => {
                // A young claim may belong to a dispatcher about to mark it running.
                if claimed_at > claimed_before {
                    continue;
                }
                warn!(job_id = %job_id, claimed_at = %claimed_at, "job claimed but never started");
                report.stranded.push(job_id);
                if repair {
                    store.restore_stranded(job_id, claimed_before).await?;
                }
            }
            Some(record) if record.is_orphaned(now, config.grace) => {
                warn!(
                    job_id = %job_id,
                    job_type = %record.job_type,
                    started_at = ?record.started_at,
                    timeout_seconds = record.timeout_seconds,
                    "orphaned job"
                );
                report.orphaned.push(job_id);
                if !repair {
                    continue;
                }
                match store.fail(job_id, WORKER_LOST_ERROR).await {
                    Ok(FailOutcome::Requeued { .. }) => report.requeued.push(job_id),
                    Ok(FailOutcome::Failed) => report.failed.push(job_id),
                    // Finished by its worker between the scan and the write.
                    Err(QueueError::InvalidTransition { .. } | QueueError::NotFound(_)) => {
                        debug!(job_id = %job_id, "orphan resolved before recovery");
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(_) => {}
        }
    }

    if report.is_clean() {
        debug!("orphan sweep found nothing");
    } else {
        info!(
            mode = ?config.mode,
            orphaned = report.orphaned.len(),
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            stranded = report.stranded.len(),
            dangling = report.dangling.len(),
            "orphan sweep finished"
        );
    }
    Ok(report)
}
