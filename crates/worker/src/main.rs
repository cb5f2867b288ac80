use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use jobforge_infra::store::RedisJobStore;
use jobforge_infra::{HandlerRegistry, WorkerConfig, WorkerPool};
use jobforge_worker::{SimulatedWork, register_builtin};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let store = RedisJobStore::connect(&config.redis_url, config.key_prefix.clone())
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))?;
    info!(store = ?store, "connected to queue store");

    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry, SimulatedWork::default());

    let handle = WorkerPool::new(Arc::new(store), registry.into_shared(), config.pool).spawn();

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown requested; draining in-flight jobs");

    let report = handle.shutdown().await;
    info!(
        pool = %report.name,
        drained = report.drained_jobs,
        processed = report.stats.jobs_processed,
        succeeded = report.stats.jobs_succeeded,
        failed = report.stats.jobs_failed,
        "worker stopped"
    );
    Ok(())
}
