//! Integration tests for the full job pipeline.
//!
//! Tests: enqueue → JobStore → WorkerPool → handler → complete/fail
//!
//! Verifies:
//! - Results and retry bookkeeping land on the record
//! - Priority bands are served highest first, FIFO within a band
//! - Concurrency, timeouts and graceful drain hold under a real pool
//! - A job is never handed to two consumers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use proptest::prelude::*;
use serde_json::{Value as JsonValue, json};

use jobforge_core::{JobId, JobRecord, JobStatus, NewJob, Priority, RetryPolicy};

use crate::handlers::HandlerRegistry;
use crate::recovery::RecoveryConfig;
use crate::store::{InMemoryJobStore, JobStore};
use crate::workers::{PoolConfig, WorkerPool, WorkerPoolHandle};

fn test_config() -> PoolConfig {
    PoolConfig::default()
        .with_name("integration")
        .with_poll_interval(Duration::from_millis(10))
        .with_recovery(RecoveryConfig::disabled())
}

fn spawn_pool(
    store: &Arc<InMemoryJobStore>,
    registry: HandlerRegistry,
    config: PoolConfig,
) -> WorkerPoolHandle {
    WorkerPool::new(store.clone(), registry.into_shared(), config).spawn()
}

/// Poll the record until `done` holds or `within` elapses.
async fn wait_for<F>(store: &InMemoryJobStore, id: JobId, within: Duration, done: F) -> JobRecord
where
    F: Fn(&JobRecord) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let record = store.get_status(id).await.unwrap().expect("record exists");
        if done(&record) {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {} after {within:?}",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn is_terminal(record: &JobRecord) -> bool {
    record.status.is_terminal()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_handler_result_is_recorded() {
    let store = InMemoryJobStore::arc();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("double", |payload: JsonValue, _owner| async move {
        let doubled: Vec<i64> = payload["numbers"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("numbers missing"))?
            .iter()
            .filter_map(JsonValue::as_i64)
            .map(|n| n * 2)
            .collect();
        anyhow::Ok(json!(doubled))
    });

    let id = store
        .enqueue(NewJob::new("double", json!({"numbers": [1, 2, 3]})).with_owner("user-1"))
        .await
        .unwrap();
    let handle = spawn_pool(&store, registry, test_config());

    let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(json!([2, 4, 6])));
    assert_eq!(record.owner.as_deref(), Some("user-1"));
    assert!(record.started_at.unwrap() <= record.completed_at.unwrap());
    assert!(record.error.is_none());

    let report = handle.shutdown().await;
    assert_eq!(report.stats.jobs_succeeded, 1);
    assert_eq!(store.stats().await.unwrap().processing, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_jobs_each_record_their_own_result() {
    let store = InMemoryJobStore::arc();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("echo", |payload: JsonValue, _owner| async move {
        let n = payload["n"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("n missing"))?;
        anyhow::Ok(json!(n * 2))
    });

    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(store.enqueue(NewJob::new("echo", json!({ "n": n }))).await.unwrap());
    }
    let handle = spawn_pool(&store, registry, test_config());

    for (id, expected) in ids.into_iter().zip([2, 4, 6]) {
        let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(json!(expected)));
        assert!(record.error.is_none());
    }

    let report = handle.shutdown().await;
    assert_eq!(report.stats.jobs_succeeded, 3);
    assert_eq!(report.stats.jobs_failed, 0);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total_pending, 0);
    assert_eq!(stats.processing, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_job_runs_max_retries_plus_one_times() {
    let store = InMemoryJobStore::arc();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("always_fails", move |_p, _o| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<JsonValue, _>(anyhow::anyhow!("boom"))
        }
    });

    let id = store
        .enqueue(NewJob::new("always_fails", json!({})).with_max_retries(2))
        .await
        .unwrap();
    let handle = spawn_pool(&store, registry, test_config());

    let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    let report = handle.shutdown().await;

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(
        record.error.as_deref(),
        Some("retries exhausted after 3 attempt(s): boom")
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.jobs_failed, 3);
    assert_eq!(report.stats.jobs_requeued, 2);
    assert_eq!(report.stats.jobs_failed_permanently, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_handler_counts_against_retries() {
    let store = InMemoryJobStore::arc();
    let id = store
        .enqueue(NewJob::new("unknown_type", json!({})).with_max_retries(1))
        .await
        .unwrap();
    let handle = spawn_pool(&store, HandlerRegistry::new(), test_config());

    let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    handle.shutdown().await;

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(
        record.error.as_deref(),
        Some("retries exhausted after 2 attempt(s): no handler registered for type: unknown_type")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn higher_priority_runs_first_with_a_single_slot() {
    let store = InMemoryJobStore::arc();
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("record", move |payload: JsonValue, _o| {
        let seen = seen.clone();
        async move {
            seen.lock().unwrap().push(payload["name"].as_str().unwrap_or_default().to_string());
            anyhow::Ok(JsonValue::Null)
        }
    });

    let mut ids = Vec::new();
    for (name, priority) in [
        ("low", Priority::Low),
        ("normal", Priority::Normal),
        ("critical", Priority::Critical),
        ("normal-2", Priority::Normal),
    ] {
        ids.push(
            store
                .enqueue(NewJob::new("record", json!({"name": name})).with_priority(priority))
                .await
                .unwrap(),
        );
    }

    let handle = spawn_pool(&store, registry, test_config().with_max_concurrent(1));
    for id in ids {
        wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    }
    handle.shutdown().await;

    assert_eq!(
        *order.lock().unwrap(),
        vec!["critical", "normal", "normal-2", "low"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn min_priority_leaves_lower_bands_alone() {
    let store = InMemoryJobStore::arc();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |_p, _o| async { anyhow::Ok(JsonValue::Null) });

    let low = store
        .enqueue(NewJob::new("noop", json!({})).with_priority(Priority::Low))
        .await
        .unwrap();
    let high = store
        .enqueue(NewJob::new("noop", json!({})).with_priority(Priority::High))
        .await
        .unwrap();

    let handle = spawn_pool(&store, registry, test_config().with_min_priority(Priority::High));
    wait_for(&store, high, Duration::from_secs(5), is_terminal).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown().await;

    assert_eq!(store.get_status(low).await.unwrap().unwrap().status, JobStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_fails_the_attempt_promptly() {
    let store = InMemoryJobStore::arc();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("sleepy", |_p, _o| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        anyhow::Ok(json!("too late"))
    });

    let id = store
        .enqueue(
            NewJob::new("sleepy", json!({}))
                .with_timeout_seconds(1)
                .with_max_retries(0),
        )
        .await
        .unwrap();
    let started = Instant::now();
    let handle = spawn_pool(&store, registry, test_config());

    let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    let elapsed = started.elapsed();
    handle.shutdown().await;

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(
        record.error.as_deref(),
        Some("retries exhausted after 1 attempt(s): job timed out after 1 seconds")
    );
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_handlers_never_exceed_max_concurrent() {
    let store = InMemoryJobStore::arc();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let mut registry = HandlerRegistry::new();
    registry.register_fn("busy", move |_p, _o| {
        let (running, peak) = (r.clone(), p.clone());
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            anyhow::Ok(JsonValue::Null)
        }
    });

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(store.enqueue(NewJob::new("busy", json!({}))).await.unwrap());
    }
    let handle = spawn_pool(&store, registry, test_config().with_max_concurrent(2));
    for id in ids {
        wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    }
    let report = handle.shutdown().await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    assert_eq!(report.stats.jobs_succeeded, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_in_flight_jobs() {
    let store = InMemoryJobStore::arc();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("slow", |_p, _o| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        anyhow::Ok(json!("done"))
    });

    let id = store.enqueue(NewJob::new("slow", json!({}))).await.unwrap();
    let handle = spawn_pool(&store, registry, test_config().with_max_concurrent(1));
    wait_for(&store, id, Duration::from_secs(5), |r| r.status == JobStatus::Running).await;

    let queued_after_stop = store.enqueue(NewJob::new("slow", json!({}))).await;
    handle.stop();
    let report = handle.drained().await;

    assert_eq!(report.drained_jobs, 1);
    let record = store.get_status(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(json!("done")));

    // Nothing new is pulled once the stop is observed.
    let later = queued_after_stop.unwrap();
    assert_eq!(store.get_status(later).await.unwrap().unwrap().status, JobStatus::Queued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_job_is_never_dispatched() {
    let store = InMemoryJobStore::arc();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", move |_p, _o| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(JsonValue::Null)
        }
    });

    let cancelled = store.enqueue(NewJob::new("noop", json!({}))).await.unwrap();
    let kept = store.enqueue(NewJob::new("noop", json!({}))).await.unwrap();
    assert!(store.cancel(cancelled).await.unwrap());

    let handle = spawn_pool(&store, registry, test_config());
    wait_for(&store, kept, Duration::from_secs(5), is_terminal).await;
    handle.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let record = store.get_status(cancelled).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert!(!store.cancel(cancelled).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backoff_holds_the_job_running_before_requeue() {
    let store = InMemoryJobStore::arc();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", move |_p, _o| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails");
            }
            anyhow::Ok(json!("recovered"))
        }
    });

    let id = store.enqueue(NewJob::new("flaky", json!({}))).await.unwrap();
    let config = test_config().with_retry_policy(RetryPolicy::fixed(Duration::from_millis(200)));
    let handle = spawn_pool(&store, registry, config);

    // First attempt fails quickly; during the backoff the record stays running.
    let deadline = Instant::now() + Duration::from_secs(2);
    while attempts.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let during = store.get_status(id).await.unwrap().unwrap();
    assert_eq!(during.status, JobStatus::Running);
    assert_eq!(during.retry_count, 0);

    let record = wait_for(&store, id, Duration::from_secs(5), is_terminal).await;
    handle.shutdown().await;

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.result, Some(json!("recovered")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_hands_out_each_job_once() {
    let store = InMemoryJobStore::arc();
    for n in 0..200 {
        store
            .enqueue(NewJob::new("noop", json!({"n": n})).with_priority(Priority::ALL[n % 4]))
            .await
            .unwrap();
    }

    let mut consumers = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        consumers.spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = store.dequeue(Priority::Low).await.unwrap() {
                got.push(job.job_id);
                tokio::task::yield_now().await;
            }
            got
        });
    }

    let mut all = Vec::new();
    while let Some(got) = consumers.join_next().await {
        all.extend(got.unwrap());
    }
    let total = all.len();
    all.sort();
    all.dedup();
    assert_eq!(total, 200);
    assert_eq!(all.len(), 200);
    assert_eq!(store.stats().await.unwrap().processing, 200);
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
        .block_on(fut)
}

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}

proptest! {
    /// Dequeue order is "highest band first, FIFO within a band".
    #[test]
    fn dequeue_order_is_band_then_fifo(priorities in prop::collection::vec(priority_strategy(), 0..40)) {
        let (enqueued, dequeued) = block_on(async {
            let store = InMemoryJobStore::new();
            let mut enqueued = Vec::new();
            for (n, priority) in priorities.iter().enumerate() {
                let id = store
                    .enqueue(NewJob::new("noop", json!({"n": n})).with_priority(*priority))
                    .await
                    .unwrap();
                enqueued.push((*priority, id));
            }
            let mut dequeued = Vec::new();
            while let Some(job) = store.dequeue(Priority::Low).await.unwrap() {
                dequeued.push(job.job_id);
            }
            (enqueued, dequeued)
        });

        let mut expected = enqueued;
        // Stable sort keeps insertion order within a band.
        expected.sort_by(|a, b| b.0.cmp(&a.0));
        let expected: Vec<JobId> = expected.into_iter().map(|(_, id)| id).collect();
        prop_assert_eq!(dequeued, expected);
    }

    /// A job failing every attempt is dispatched exactly `max_retries + 1` times.
    #[test]
    fn retry_bound_holds(max_retries in 0u32..6) {
        let (dispatches, record) = block_on(async {
            let store = InMemoryJobStore::new();
            let id = store
                .enqueue(NewJob::new("noop", json!({})).with_max_retries(max_retries))
                .await
                .unwrap();
            let mut dispatches = 0u32;
            while let Some(job) = store.dequeue(Priority::Low).await.unwrap() {
                dispatches += 1;
                store.fail(job.job_id, "nope").await.unwrap();
            }
            (dispatches, store.get_status(id).await.unwrap().unwrap())
        });

        prop_assert_eq!(dispatches, max_retries + 1);
        prop_assert_eq!(record.status, JobStatus::Failed);
        prop_assert_eq!(record.retry_count, max_retries);
    }
}
