//! Dispatcher loop and bounded worker pool.

use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use jobforge_core::{FailOutcome, JobRecord, Priority, QueueError, RetryPolicy};

use crate::handlers::HandlerRegistry;
use crate::recovery::{self, RecoveryConfig, RecoveryMode};
use crate::store::JobStore;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name for logging
    pub name: String,
    /// Maximum concurrently running handlers
    pub max_concurrent: usize,
    /// Sleep between polls when no job is available
    pub poll_interval: Duration,
    /// Lowest band this pool dispatches
    pub min_priority: Priority,
    /// Delay before a failed job is handed back to the store
    pub retry_policy: RetryPolicy,
    /// Orphan sweep settings
    pub recovery: RecoveryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "job-worker-pool".to_string(),
            max_concurrent: 5,
            poll_interval: Duration::from_secs(1),
            min_priority: Priority::Low,
            retry_policy: RetryPolicy::immediate(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_min_priority(mut self, min_priority: Priority) -> Self {
        self.min_priority = min_priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    /// Failed attempts, whether requeued or final
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub jobs_failed_permanently: u64,
    /// Outcomes the store refused or could not record
    pub outcomes_unrecorded: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    failed_permanently: AtomicU64,
    unrecorded: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn snapshot(&self, started: Instant) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_requeued: self.requeued.load(Ordering::Relaxed),
            jobs_failed_permanently: self.failed_permanently.load(Ordering::Relaxed),
            outcomes_unrecorded: self.unrecorded.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: started.elapsed().as_secs(),
        }
    }
}

/// Final report once a stopped pool has drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub name: String,
    /// Jobs still running when the stop was observed
    pub drained_jobs: usize,
    pub stats: ExecutorStats,
}

/// Handle to control a running pool.
///
/// Dropping the handle also requests a stop; in-flight jobs still finish.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: String,
    stop: watch::Sender<bool>,
    join: JoinHandle<PoolReport>,
    counters: Arc<Counters>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Request a cooperative stop: no new jobs are pulled.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot(self.started)
    }

    /// Wait until the pool has stopped and every running job has finished or
    /// timed out. Only resolves after [`stop`](Self::stop).
    pub async fn drained(self) -> PoolReport {
        let Self {
            name,
            stop,
            join,
            counters,
            started,
        } = self;

        let report = match join.await {
            Ok(report) => report,
            Err(err) => {
                error!(pool = %name, error = %err, "dispatcher task ended abnormally");
                PoolReport {
                    name,
                    drained_jobs: 0,
                    stats: counters.snapshot(started),
                }
            }
        };
        drop(stop);
        report
    }

    /// Stop and wait for the drain.
    pub async fn shutdown(self) -> PoolReport {
        self.stop();
        self.drained().await
    }
}

/// Shared state for one pool's job tasks.
struct PoolContext<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: PoolConfig,
    counters: Arc<Counters>,
}

/// Background worker pool.
///
/// Polls a job store for pending jobs, runs them with registered handlers on
/// at most `max_concurrent` slots, and reports every outcome back to the store.
pub struct WorkerPool<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: PoolConfig,
}

impl<S> WorkerPool<S>
where
    S: JobStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, config: PoolConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Spawn the dispatcher on the current tokio runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let started = Instant::now();
        let name = self.config.name.clone();

        let ctx = Arc::new(PoolContext {
            store: self.store,
            registry: self.registry,
            config: self.config,
            counters: counters.clone(),
        });
        let join = tokio::spawn(dispatch_loop(ctx, stop_rx, started));

        WorkerPoolHandle {
            name,
            stop: stop_tx,
            join,
            counters,
            started,
        }
    }
}

/// Resolves once a stop was requested (or the handle is gone).
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn idle_wait(stop_rx: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = stop_requested(stop_rx) => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

async fn dispatch_loop<S>(
    ctx: Arc<PoolContext<S>>,
    mut stop_rx: watch::Receiver<bool>,
    started: Instant,
) -> PoolReport
where
    S: JobStore + ?Sized + 'static,
{
    let config = &ctx.config;
    let max_concurrent = config.max_concurrent.max(1);
    info!(
        pool = %config.name,
        max_concurrent,
        min_priority = %config.min_priority,
        handlers = ?ctx.registry.job_types(),
        "job worker pool started"
    );

    let slots = Arc::new(Semaphore::new(max_concurrent));
    let mut in_flight = JoinSet::new();
    let mut next_sweep = Instant::now();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        while let Some(finished) = in_flight.try_join_next() {
            if let Err(err) = finished {
                error!(pool = %config.name, error = %err, "job task ended abnormally");
            }
        }

        if config.recovery.mode != RecoveryMode::Disabled && Instant::now() >= next_sweep {
            next_sweep = Instant::now() + config.recovery.interval;
            if let Err(err) = recovery::recover_orphans(ctx.store.as_ref(), &config.recovery).await {
                warn!(pool = %config.name, error = %err, "orphan sweep failed");
            }
        }

        let permit = tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        match ctx.store.dequeue(config.min_priority).await {
            Ok(Some(job)) => {
                let span = info_span!(
                    "job",
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    priority = %job.priority,
                    attempt = job.retry_count + 1
                );
                in_flight.spawn(run_job(ctx.clone(), job, permit).instrument(span));
            }
            Ok(None) => {
                drop(permit);
                idle_wait(&mut stop_rx, config.poll_interval).await;
            }
            Err(err) => {
                drop(permit);
                error!(pool = %config.name, error = %err, "failed to dequeue job");
                idle_wait(&mut stop_rx, config.poll_interval).await;
            }
        }
    }

    let drained_jobs = in_flight.len();
    info!(pool = %config.name, in_flight = drained_jobs, "job worker pool stopping");
    while let Some(finished) = in_flight.join_next().await {
        if let Err(err) = finished {
            error!(pool = %config.name, error = %err, "job task ended abnormally");
        }
    }

    let stats = ctx.counters.snapshot(started);
    info!(pool = %config.name, processed = stats.jobs_processed, "job worker pool stopped");
    PoolReport {
        name: config.name.clone(),
        drained_jobs,
        stats,
    }
}

async fn run_job<S>(ctx: Arc<PoolContext<S>>, job: JobRecord, permit: OwnedSemaphorePermit)
where
    S: JobStore + ?Sized + 'static,
{
    let counters = &ctx.counters;
    counters.running.fetch_add(1, Ordering::Relaxed);
    info!("processing job");

    let outcome = execute(&ctx.registry, &job).await;

    counters.running.fetch_sub(1, Ordering::Relaxed);
    counters.processed.fetch_add(1, Ordering::Relaxed);

    match outcome {
        Ok(result) => {
            drop(permit);
            match ctx.store.complete(job.job_id, result).await {
                Ok(()) => {
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => record_unrecorded(counters, &err, "complete"),
            }
        }
        Err(error) => {
            drop(permit);
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %error, "job attempt failed");

            if job.retry_count < job.max_retries {
                let delay = ctx.config.retry_policy.delay_for_attempt(job.retry_count + 1);
                if !delay.is_zero() {
                    debug!(delay_ms = delay.as_millis() as u64, "holding failed job before requeue");
                    tokio::time::sleep(delay).await;
                }
            }

            match ctx.store.fail(job.job_id, &error).await {
                Ok(FailOutcome::Requeued { .. }) => {
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Ok(FailOutcome::Failed) => {
                    counters.failed_permanently.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => record_unrecorded(counters, &err, "fail"),
            }
        }
    }
}

fn record_unrecorded(counters: &Counters, err: &QueueError, op: &str) {
    counters.unrecorded.fetch_add(1, Ordering::Relaxed);
    // The id stays in the processing set; the orphan sweep picks it up.
    error!(error = %err, op, "failed to record job outcome");
}

/// Run the job's handler under its timeout. `Err` carries the text recorded
/// as the attempt's error.
async fn execute(registry: &HandlerRegistry, job: &JobRecord) -> Result<JsonValue, String> {
    let Some(handler) = registry.get(&job.job_type) else {
        return Err(format!("no handler registered for type: {}", job.job_type));
    };

    let payload = job.payload.clone();
    let owner = job.owner.clone();
    let task = tokio::spawn(async move { handler.handle(payload, owner).await });
    let abort = task.abort_handle();

    match tokio::time::timeout(job.timeout(), task).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(err))) => Err(format!("{err:#}")),
        Ok(Err(join_err)) if join_err.is_panic() => Err(format!(
            "handler panicked: {}",
            panic_message(join_err.into_panic())
        )),
        Ok(Err(join_err)) => Err(format!("handler task cancelled: {join_err}")),
        Err(_elapsed) => {
            abort.abort();
            Err(format!("job timed out after {} seconds", job.timeout_seconds))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use jobforge_core::{JobStatus, NewJob};
    use serde_json::json;

    fn fast_config() -> PoolConfig {
        PoolConfig::default()
            .with_name("test-pool")
            .with_poll_interval(Duration::from_millis(10))
            .with_recovery(RecoveryConfig::disabled())
    }

    async fn record_of(job: NewJob) -> JobRecord {
        let mut record = job.into_record(chrono::Utc::now()).unwrap();
        record.mark_running(chrono::Utc::now()).unwrap();
        record
    }

    #[tokio::test]
    async fn execute_reports_missing_handler() {
        let registry = HandlerRegistry::new();
        let job = record_of(NewJob::new("ghost", json!({}))).await;

        let err = execute(&registry, &job).await.unwrap_err();
        assert_eq!(err, "no handler registered for type: ghost");
    }

    #[tokio::test]
    async fn execute_records_handler_error_text() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("flaky", |_p, _o| async {
            Err::<JsonValue, _>(anyhow::anyhow!("upstream returned 503"))
        });
        let job = record_of(NewJob::new("flaky", json!({}))).await;

        assert_eq!(execute(&registry, &job).await.unwrap_err(), "upstream returned 503");
    }

    #[tokio::test]
    async fn execute_converts_panics() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("bad", |_p, _o| async {
            if true {
                panic!("index out of range");
            }
            anyhow::Ok(json!(null))
        });
        let job = record_of(NewJob::new("bad", json!({}))).await;

        let err = execute(&registry, &job).await.unwrap_err();
        assert_eq!(err, "handler panicked: index out of range");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_enforces_timeout() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_p, _o| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            anyhow::Ok(json!("late"))
        });
        let job = record_of(NewJob::new("slow", json!({})).with_timeout_seconds(2)).await;

        let err = execute(&registry, &job).await.unwrap_err();
        assert_eq!(err, "job timed out after 2 seconds");
    }

    #[tokio::test]
    async fn stop_on_idle_pool_drains_immediately() {
        let store = InMemoryJobStore::arc();
        let pool = WorkerPool::new(store, HandlerRegistry::new().into_shared(), fast_config());

        let handle = pool.spawn();
        assert!(!handle.is_stopping());
        let report = handle.shutdown().await;
        assert_eq!(report.name, "test-pool");
        assert_eq!(report.drained_jobs, 0);
        assert_eq!(report.stats.jobs_processed, 0);
    }

    #[tokio::test]
    async fn store_outage_does_not_kill_the_dispatcher() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("echo", |payload, _o| async move { anyhow::Ok(payload) });

        let id = store.enqueue(NewJob::new("echo", json!({"x": 1}))).await.unwrap();
        store.set_available(false);

        let handle = WorkerPool::new(store.clone(), registry.into_shared(), fast_config()).spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.stats().jobs_processed, 0);

        store.set_available(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = store.get_status(id).await.unwrap().unwrap();
            if record.status == JobStatus::Completed {
                assert_eq!(record.result, Some(json!({"x": 1})));
                break;
            }
            assert!(Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = handle.shutdown().await;
        assert_eq!(report.stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn unrecorded_completion_is_not_counted_as_success() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        let outage = store.clone();
        registry.register_fn("echo", move |payload, _o| {
            let outage = outage.clone();
            async move {
                outage.set_available(false);
                anyhow::Ok(payload)
            }
        });

        let id = store.enqueue(NewJob::new("echo", json!({"x": 1}))).await.unwrap();
        let handle = WorkerPool::new(store.clone(), registry.into_shared(), fast_config()).spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().outcomes_unrecorded == 0 {
            assert!(Instant::now() < deadline, "completion was never attempted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.stats();
        assert_eq!(stats.jobs_processed, 1);
        assert_eq!(stats.jobs_succeeded, 0);
        assert_eq!(stats.outcomes_unrecorded, 1);

        store.set_available(true);
        assert_eq!(store.get_status(id).await.unwrap().unwrap().status, JobStatus::Running);
        let report = handle.shutdown().await;
        assert_eq!(report.stats.jobs_succeeded, 0);
    }

    #[tokio::test]
    async fn sweeps_survive_jobs_with_huge_timeouts() {
        let store = InMemoryJobStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_p, _o| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            anyhow::Ok(json!("slow"))
        });
        registry.register_fn("echo", |payload, _o| async move { anyhow::Ok(payload) });

        let slow = store.enqueue(NewJob::new("slow", json!({}))).await.unwrap();
        store.edit_record(slow, |record| record.timeout_seconds = u64::MAX);
        let config = fast_config().with_recovery(RecoveryConfig {
            mode: RecoveryMode::Audit,
            interval: Duration::from_millis(10),
            grace: Duration::MAX,
        });
        let handle = WorkerPool::new(store.clone(), registry.into_shared(), config).spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = store.enqueue(NewJob::new("echo", json!({"n": 1}))).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        for id in [slow, fast] {
            loop {
                let record = store.get_status(id).await.unwrap().unwrap();
                if record.status == JobStatus::Completed {
                    break;
                }
                assert!(Instant::now() < deadline, "job never completed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        let report = handle.shutdown().await;
        assert_eq!(report.stats.jobs_succeeded, 2);
    }
}
