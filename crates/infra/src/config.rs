//! Orchestrator configuration, loaded from the environment.
//!
//! Every knob has a default; `.env` files are honoured via `dotenvy`.

use std::str::FromStr;
use std::time::Duration;

use crate::jobs::maintenance::{MaintenanceSettings, ScheduleConfig};
use crate::jobs::submitter::AttemptLimits;
use crate::jobs::types::{JobCategory, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub ingestion: usize,
    pub generation: usize,
    pub maintenance: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Postgres result store; in-memory when unset.
    pub database_url: Option<String>,
    /// Redis queue and cache; in-memory when unset.
    pub redis_url: Option<String>,
    pub workers: PoolSizes,
    pub attempts: AttemptLimits,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub visibility_timeout: Duration,
    pub external_call_timeout: Duration,
    pub staleness_threshold: Duration,
    pub sweep_interval: Duration,
    pub snapshot_cache_ttl: Duration,
    pub job_status_cache_ttl: Duration,
    pub job_retention_days: u32,
    pub snapshot_retention_days: u32,
    pub prompt_version: String,
    pub bind_addr: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            workers: PoolSizes {
                ingestion: 4,
                generation: 2,
                maintenance: 1,
            },
            attempts: AttemptLimits::default(),
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(900),
            external_call_timeout: Duration::from_secs(300),
            staleness_threshold: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            snapshot_cache_ttl: Duration::from_secs(3600),
            job_status_cache_ttl: Duration::from_secs(3600),
            job_retention_days: 30,
            snapshot_retention_days: 365,
            prompt_version: "v1.0".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from the process environment (and `.env`, if present), then validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            workers: PoolSizes {
                ingestion: positive(&get, "INGESTION_WORKERS", d.workers.ingestion)?,
                generation: positive(&get, "GENERATION_WORKERS", d.workers.generation)?,
                maintenance: positive(&get, "MAINTENANCE_WORKERS", d.workers.maintenance)?,
            },
            attempts: AttemptLimits {
                ingestion: positive(&get, "INGESTION_MAX_ATTEMPTS", d.attempts.ingestion)?,
                generation: positive(&get, "GENERATION_MAX_ATTEMPTS", d.attempts.generation)?,
                maintenance: positive(&get, "MAINTENANCE_MAX_ATTEMPTS", d.attempts.maintenance)?,
            },
            retry_base_delay: secs(&get, "RETRY_BASE_DELAY_SECS", d.retry_base_delay)?,
            retry_max_delay: secs(&get, "RETRY_MAX_DELAY_SECS", d.retry_max_delay)?,
            visibility_timeout: secs(&get, "VISIBILITY_TIMEOUT_SECS", d.visibility_timeout)?,
            external_call_timeout: secs(&get, "EXTERNAL_CALL_TIMEOUT_SECS", d.external_call_timeout)?,
            staleness_threshold: secs(&get, "STALENESS_THRESHOLD_SECS", d.staleness_threshold)?,
            sweep_interval: secs(&get, "SWEEP_INTERVAL_SECS", d.sweep_interval)?,
            snapshot_cache_ttl: secs(&get, "SNAPSHOT_CACHE_TTL_SECS", d.snapshot_cache_ttl)?,
            job_status_cache_ttl: secs(&get, "JOB_STATUS_CACHE_TTL_SECS", d.job_status_cache_ttl)?,
            job_retention_days: positive(&get, "JOB_RETENTION_DAYS", d.job_retention_days)?,
            snapshot_retention_days: positive(&get, "SNAPSHOT_RETENTION_DAYS", d.snapshot_retention_days)?,
            prompt_version: get("PROMPT_VERSION").unwrap_or(d.prompt_version),
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make the sweep fight the retry path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::Inconsistent(
                "RETRY_BASE_DELAY_SECS must not exceed RETRY_MAX_DELAY_SECS".into(),
            ));
        }
        if self.retry_max_delay >= self.staleness_threshold {
            return Err(ConfigError::Inconsistent(
                "RETRY_MAX_DELAY_SECS must be below STALENESS_THRESHOLD_SECS".into(),
            ));
        }
        if self.external_call_timeout >= self.visibility_timeout {
            return Err(ConfigError::Inconsistent(
                "EXTERNAL_CALL_TIMEOUT_SECS must be below VISIBILITY_TIMEOUT_SECS".into(),
            ));
        }
        if self.external_call_timeout >= self.staleness_threshold {
            return Err(ConfigError::Inconsistent(
                "EXTERNAL_CALL_TIMEOUT_SECS must be below STALENESS_THRESHOLD_SECS".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Inconsistent("SWEEP_INTERVAL_SECS must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self, category: JobCategory) -> RetryPolicy {
        RetryPolicy::exponential(
            self.attempts.for_category(category),
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }

    pub fn workers(&self, category: JobCategory) -> usize {
        match category {
            JobCategory::Ingestion => self.workers.ingestion,
            JobCategory::Generation => self.workers.generation,
            JobCategory::Maintenance => self.workers.maintenance,
        }
    }

    pub fn maintenance_settings(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            staleness_threshold: self.staleness_threshold,
            job_retention_days: self.job_retention_days,
            snapshot_retention_days: self.snapshot_retention_days,
            ..Default::default()
        }
    }

    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig {
            sweep_interval: self.sweep_interval,
            ..Default::default()
        }
    }
}

fn parse<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn positive<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Copy,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    let value = parse(get, var, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            value: get(var).unwrap_or_default(),
            reason: "must be positive".into(),
        });
    }
    Ok(value)
}

fn secs<G>(get: &G, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, var, default.as_secs()).map(Duration::from_secs)
}
