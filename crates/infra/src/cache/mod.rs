//! Cache layer in front of the result store.
//!
//! The cache is an accelerator only: every read path falls back to the store
//! and every failure here is logged and treated as a miss.
//!
//! | Key | Value | TTL |
//! |-----|-------|-----|
//! | `snapshot:{user}:{date}:{range}` | snapshot JSON | snapshot TTL |
//! | `snapshot:{id}` | snapshot JSON | snapshot TTL |
//! | `insight:{snapshot}:{category}:{tone}:{prompt_version}` | insight JSON | none |
//! | `insight:{id}` | insight JSON | none |
//! | `job:{id}` | terminal job JSON | job status TTL |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use moodscope_core::{InsightId, SnapshotId};

use crate::jobs::types::{Job, JobId};
use crate::store::{Insight, InsightKey, Snapshot, SnapshotKey};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Plain string key/value cache with optional expiry.
#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// `ttl = None` keeps the value until it is deleted or evicted.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

pub fn snapshot_id_key(id: SnapshotId) -> String {
    format!("snapshot:{id}")
}

pub fn insight_id_key(id: InsightId) -> String {
    format!("insight:{id}")
}

pub fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

/// Typed, fail-open view over a [`Cache`].
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<dyn Cache>,
    snapshot_ttl: Duration,
    job_status_ttl: Duration,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("snapshot_ttl", &self.snapshot_ttl)
            .field("job_status_ttl", &self.job_status_ttl)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(inner: Arc<dyn Cache>, snapshot_ttl: Duration, job_status_ttl: Duration) -> Self {
        Self {
            inner,
            snapshot_ttl,
            job_status_ttl,
        }
    }

    /// In-process cache with one-hour TTLs.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCache::new()),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        )
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.inner.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed; falling back to store");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "dropping undecodable cache entry");
                self.remove(key).await;
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "cache value not serializable");
                return;
            }
        };
        if let Err(e) = self.inner.set(key, raw, ttl).await {
            warn!(key, error = %e, "cache write failed");
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.inner.delete(key).await {
            warn!(key, error = %e, "cache delete failed");
        }
    }

    pub async fn snapshot(&self, id: SnapshotId) -> Option<Snapshot> {
        self.read(&snapshot_id_key(id)).await
    }

    pub async fn snapshot_by_key(&self, key: &SnapshotKey) -> Option<Snapshot> {
        self.read(&key.cache_key()).await
    }

    pub async fn put_snapshot(&self, snapshot: &Snapshot) {
        let ttl = Some(self.snapshot_ttl);
        self.write(&snapshot.key().cache_key(), snapshot, ttl).await;
        self.write(&snapshot_id_key(snapshot.id), snapshot, ttl).await;
    }

    pub async fn invalidate_snapshot(&self, id: SnapshotId, key: &SnapshotKey) {
        self.remove(&snapshot_id_key(id)).await;
        self.remove(&key.cache_key()).await;
    }

    pub async fn insight(&self, id: InsightId) -> Option<Insight> {
        self.read(&insight_id_key(id)).await
    }

    pub async fn insight_by_key(&self, key: &InsightKey) -> Option<Insight> {
        self.read(&key.cache_key()).await
    }

    /// Insights never change once written, so they carry no TTL.
    pub async fn put_insight(&self, insight: &Insight) {
        self.write(&insight.key().cache_key(), insight, None).await;
        self.write(&insight_id_key(insight.id), insight, None).await;
    }

    pub async fn invalidate_insight(&self, id: InsightId, key: &InsightKey) {
        self.remove(&insight_id_key(id)).await;
        self.remove(&key.cache_key()).await;
    }

    pub async fn job(&self, id: JobId) -> Option<Job> {
        self.read(&job_key(id)).await
    }

    pub async fn invalidate_job(&self, id: JobId) {
        self.remove(&job_key(id)).await;
    }

    /// Only terminal jobs are cached; anything else would go stale.
    pub async fn put_job(&self, job: &Job) {
        if job.status.is_terminal() {
            self.write(&job_key(job.id), job, Some(self.job_status_ttl)).await;
        }
    }
}
