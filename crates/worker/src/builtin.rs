//! Built-in job handlers.
//!
//! The work itself is simulated with a sleep; each handler returns a JSON
//! summary stamped with the completion time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use jobforge_infra::{HandlerRegistry, JobHandler};

pub const TASK_EXECUTION: &str = "task_execution";
pub const DATA_PROCESSING: &str = "data_processing";
pub const NOTIFICATION: &str = "notification";
pub const BACKUP: &str = "backup";

/// How long each built-in handler pretends to work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedWork {
    pub task_execution: Duration,
    pub data_processing: Duration,
    pub notification: Duration,
    pub backup: Duration,
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self {
            task_execution: Duration::from_secs(2),
            data_processing: Duration::from_secs(1),
            notification: Duration::from_millis(500),
            backup: Duration::from_secs(5),
        }
    }
}

impl SimulatedWork {
    /// No simulated delay at all.
    pub fn instant() -> Self {
        Self {
            task_execution: Duration::ZERO,
            data_processing: Duration::ZERO,
            notification: Duration::ZERO,
            backup: Duration::ZERO,
        }
    }
}

/// Register all four built-in handlers.
pub fn register_builtin(registry: &mut HandlerRegistry, work: SimulatedWork) -> &mut HandlerRegistry {
    registry
        .register(TASK_EXECUTION, TaskExecution { work: work.task_execution })
        .register(DATA_PROCESSING, DataProcessing { work: work.data_processing })
        .register(NOTIFICATION, Notification { work: work.notification })
        .register(BACKUP, Backup { work: work.backup })
}

async fn simulate(work: Duration) {
    if !work.is_zero() {
        tokio::time::sleep(work).await;
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Deserialize)]
struct TaskExecutionPayload {
    agent: Option<String>,
    #[serde(default = "empty_object")]
    task_data: JsonValue,
}

fn empty_object() -> JsonValue {
    json!({})
}

/// Runs an agent task.
pub struct TaskExecution {
    work: Duration,
}

#[async_trait]
impl JobHandler for TaskExecution {
    async fn handle(&self, payload: JsonValue, owner: Option<String>) -> anyhow::Result<JsonValue> {
        let payload: TaskExecutionPayload = serde_json::from_value(payload)?;
        let agent = payload.agent.unwrap_or_default();
        info!(agent = %agent, owner = ?owner, "executing agent task");

        simulate(self.work).await;

        Ok(json!({
            "agent": agent,
            "task": payload.task_data,
            "status": "completed",
            "result": format!("Task executed by {agent}"),
            "timestamp": timestamp(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct DataProcessingPayload {
    operation: Option<String>,
    #[serde(default)]
    data: Vec<JsonValue>,
}

/// Processes a batch of items.
pub struct DataProcessing {
    work: Duration,
}

#[async_trait]
impl JobHandler for DataProcessing {
    async fn handle(&self, payload: JsonValue, _owner: Option<String>) -> anyhow::Result<JsonValue> {
        let payload: DataProcessingPayload = serde_json::from_value(payload)?;
        simulate(self.work).await;

        Ok(json!({
            "operation": payload.operation,
            "processed_items": payload.data.len(),
            "status": "completed",
            "timestamp": timestamp(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct NotificationPayload {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    recipients: Vec<String>,
}

/// Sends a notification to a list of recipients.
pub struct Notification {
    work: Duration,
}

#[async_trait]
impl JobHandler for Notification {
    async fn handle(&self, payload: JsonValue, _owner: Option<String>) -> anyhow::Result<JsonValue> {
        let payload: NotificationPayload = serde_json::from_value(payload)?;
        simulate(self.work).await;

        Ok(json!({
            "type": payload.kind,
            "recipients_count": payload.recipients.len(),
            "status": "sent",
            "timestamp": timestamp(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct BackupPayload {
    #[serde(rename = "type", default = "full_backup")]
    kind: String,
    target: Option<String>,
}

fn full_backup() -> String {
    "full".to_string()
}

/// Backs up a target.
pub struct Backup {
    work: Duration,
}

#[async_trait]
impl JobHandler for Backup {
    async fn handle(&self, payload: JsonValue, _owner: Option<String>) -> anyhow::Result<JsonValue> {
        let payload: BackupPayload = serde_json::from_value(payload)?;
        simulate(self.work).await;

        Ok(json!({
            "backup_type": payload.kind,
            "target": payload.target,
            "status": "completed",
            "size_mb": 150.5,
            "timestamp": timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        register_builtin(&mut registry, SimulatedWork::instant());
        registry
    }

    async fn run(job_type: &str, payload: JsonValue) -> anyhow::Result<JsonValue> {
        registry()
            .get(job_type)
            .expect("registered")
            .handle(payload, Some("user-1".into()))
            .await
    }

    #[test]
    fn registers_all_four() {
        assert_eq!(
            registry().job_types(),
            vec![BACKUP, DATA_PROCESSING, NOTIFICATION, TASK_EXECUTION]
        );
    }

    #[tokio::test]
    async fn task_execution_summary() {
        let out = run(TASK_EXECUTION, json!({"agent": "researcher", "task_data": {"q": "x"}}))
            .await
            .unwrap();
        assert_eq!(out["agent"], "researcher");
        assert_eq!(out["task"], json!({"q": "x"}));
        assert_eq!(out["result"], "Task executed by researcher");
        assert_eq!(out["status"], "completed");
        assert!(out["timestamp"].is_string());
    }

    #[tokio::test]
    async fn data_processing_counts_items() {
        let out = run(DATA_PROCESSING, json!({"operation": "sum", "data": [1, 2, 3, 4]}))
            .await
            .unwrap();
        assert_eq!(out["operation"], "sum");
        assert_eq!(out["processed_items"], 4);
    }

    #[tokio::test]
    async fn notification_counts_recipients() {
        let out = run(NOTIFICATION, json!({"type": "email", "recipients": ["a@x", "b@x"]}))
            .await
            .unwrap();
        assert_eq!(out["type"], "email");
        assert_eq!(out["recipients_count"], 2);
        assert_eq!(out["status"], "sent");
    }

    #[tokio::test]
    async fn backup_defaults_to_full() {
        let out = run(BACKUP, json!({"target": "database"})).await.unwrap();
        assert_eq!(out["backup_type"], "full");
        assert_eq!(out["target"], "database");
        assert_eq!(out["size_mb"], 150.5);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_error() {
        let err = run(NOTIFICATION, json!({"recipients": "not-a-list"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid type"));
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_work_takes_configured_time() {
        let handler = Backup {
            work: Duration::from_secs(5),
        };
        let started = tokio::time::Instant::now();
        handler.handle(json!({}), None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
