//! Configuration loading from the environment.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use jobforge_core::{BackoffStrategy, Priority, RetryPolicy};

use crate::recovery::{RecoveryConfig, RecoveryMode};
use crate::workers::PoolConfig;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Process configuration for the worker binary.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    /// `None` uses the store's default prefix
    pub key_prefix: Option<String>,
    pub pool: PoolConfig,
}

impl WorkerConfig {
    /// Read `JOBFORGE_*` variables. Unset variables take defaults; set but
    /// unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let redis_url = var("JOBFORGE_REDIS_URL").unwrap_or_else(|| {
            warn!("JOBFORGE_REDIS_URL not set; using {DEFAULT_REDIS_URL}");
            DEFAULT_REDIS_URL.to_string()
        });
        let key_prefix = var("JOBFORGE_KEY_PREFIX");

        let defaults = PoolConfig::default();
        let max_concurrent = parse_or(&var, "JOBFORGE_MAX_CONCURRENT", defaults.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "JOBFORGE_MAX_CONCURRENT",
                "0",
                "must be at least 1",
            ));
        }
        let poll_interval_ms = parse_or(
            &var,
            "JOBFORGE_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        )?;

        let min_priority = match var("JOBFORGE_MIN_PRIORITY") {
            Some(raw) => raw
                .parse::<Priority>()
                .map_err(|e| ConfigError::invalid("JOBFORGE_MIN_PRIORITY", &raw, e))?,
            None => defaults.min_priority,
        };

        let recovery_defaults = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            mode: match var("JOBFORGE_RECOVERY") {
                Some(raw) => raw
                    .parse::<RecoveryMode>()
                    .map_err(|e| ConfigError::invalid("JOBFORGE_RECOVERY", &raw, e))?,
                None => recovery_defaults.mode,
            },
            interval: Duration::from_secs(parse_or(
                &var,
                "JOBFORGE_RECOVERY_INTERVAL_SECS",
                recovery_defaults.interval.as_secs(),
            )?),
            grace: Duration::from_secs(parse_or(
                &var,
                "JOBFORGE_RECOVERY_GRACE_SECS",
                recovery_defaults.grace.as_secs(),
            )?),
        };

        let retry_policy = retry_policy(&var)?;

        Ok(Self {
            redis_url,
            key_prefix,
            pool: defaults
                .with_max_concurrent(max_concurrent)
                .with_poll_interval(Duration::from_millis(poll_interval_ms))
                .with_min_priority(min_priority)
                .with_recovery(recovery)
                .with_retry_policy(retry_policy),
        })
    }
}

fn retry_policy<F>(var: &F) -> Result<RetryPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let strategy = match var("JOBFORGE_BACKOFF") {
        Some(raw) => raw
            .parse::<BackoffStrategy>()
            .map_err(|e| ConfigError::invalid("JOBFORGE_BACKOFF", &raw, e))?,
        None => BackoffStrategy::None,
    };
    let base = Duration::from_millis(parse_or(var, "JOBFORGE_BACKOFF_BASE_MS", 500)?);
    let max = Duration::from_millis(parse_or(var, "JOBFORGE_BACKOFF_MAX_MS", 60_000)?);

    Ok(match strategy {
        BackoffStrategy::None => RetryPolicy::immediate(),
        BackoffStrategy::Fixed => RetryPolicy::fixed(base),
        BackoffStrategy::Linear => RetryPolicy::linear(base, max),
        BackoffStrategy::Exponential => RetryPolicy::exponential(base, max),
    })
}

fn parse_or<F, T>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, &raw, e)),
        None => Ok(default),
    }
}
