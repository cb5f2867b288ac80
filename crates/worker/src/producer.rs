//! Enqueue helpers for the built-in job types.

use serde_json::{Value as JsonValue, json};

use jobforge_core::{JobId, NewJob, Priority, QueueResult};
use jobforge_infra::JobStore;

use crate::builtin::{BACKUP, DATA_PROCESSING, NOTIFICATION, TASK_EXECUTION};

/// Queue an agent task on behalf of `owner` (default band: normal).
pub async fn enqueue_task_execution<S>(
    store: &S,
    agent: &str,
    task_data: JsonValue,
    owner: &str,
    priority: Option<Priority>,
) -> QueueResult<JobId>
where
    S: JobStore + ?Sized,
{
    let job = NewJob::new(TASK_EXECUTION, json!({"agent": agent, "task_data": task_data}))
        .with_owner(owner)
        .with_priority(priority.unwrap_or(Priority::Normal));
    store.enqueue(job).await
}

/// Queue a batch for processing (default band: low).
pub async fn enqueue_data_processing<S>(
    store: &S,
    operation: &str,
    data: Vec<JsonValue>,
    owner: Option<&str>,
    priority: Option<Priority>,
) -> QueueResult<JobId>
where
    S: JobStore + ?Sized,
{
    let mut job = NewJob::new(DATA_PROCESSING, json!({"operation": operation, "data": data}))
        .with_priority(priority.unwrap_or(Priority::Low));
    if let Some(owner) = owner {
        job = job.with_owner(owner);
    }
    store.enqueue(job).await
}

/// Queue a notification (default band: normal).
pub async fn enqueue_notification<S>(
    store: &S,
    kind: &str,
    recipients: &[String],
    priority: Option<Priority>,
) -> QueueResult<JobId>
where
    S: JobStore + ?Sized,
{
    let job = NewJob::new(NOTIFICATION, json!({"type": kind, "recipients": recipients}))
        .with_priority(priority.unwrap_or(Priority::Normal));
    store.enqueue(job).await
}

/// Queue a backup; `kind` defaults to `full` and `target` to `database`
/// (default band: low).
pub async fn enqueue_backup<S>(
    store: &S,
    kind: Option<&str>,
    target: Option<&str>,
    priority: Option<Priority>,
) -> QueueResult<JobId>
where
    S: JobStore + ?Sized,
{
    let job = NewJob::new(
        BACKUP,
        json!({
            "type": kind.unwrap_or("full"),
            "target": target.unwrap_or("database"),
        }),
    )
    .with_priority(priority.unwrap_or(Priority::Low));
    store.enqueue(job).await
}
