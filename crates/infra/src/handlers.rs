//! Handler registry: job type string -> handler.
//!
//! Built once at startup, then shared read-only (`Arc<HandlerRegistry>`) with
//! the worker pool. There is no global registry; each pool gets its own.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

/// Executes one job type.
///
/// Handlers must be idempotent: delivery is at-least-once, so the same job may
/// run more than once (e.g. after a crash between the handler returning and
/// the result being recorded).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: JsonValue, owner: Option<String>) -> anyhow::Result<JsonValue>;
}

type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<JsonValue>> + Send>>;

struct FnHandler {
    f: Box<dyn Fn(JsonValue, Option<String>) -> BoxedFuture + Send + Sync>,
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn handle(&self, payload: JsonValue, owner: Option<String>) -> anyhow::Result<JsonValue> {
        (self.f)(payload, owner).await
    }
}

/// Mapping from job type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        if self
            .handlers
            .insert(job_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!(job_type = %job_type, "replaced previously registered handler");
        } else {
            info!(job_type = %job_type, "registered handler");
        }
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JsonValue, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
    {
        self.register(
            job_type,
            FnHandler {
                f: Box::new(move |payload, owner| -> BoxedFuture { Box::pin(f(payload, owner)) }),
            },
        )
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Freeze the registry for sharing with a pool.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
