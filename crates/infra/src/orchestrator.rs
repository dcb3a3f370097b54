//! Client-facing facade over the job system, plus the worker runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use moodscope_core::{InsightCategory, InsightId, SnapshotId, TimeRange, Tone, UserId};
use moodscope_insights::{ListeningSource, TextGenerator};

use crate::cache::{InMemoryCache, ResultCache};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::jobs::{
    GenerationHandler, IngestionHandler, InMemoryJobQueue, JobCategory, JobHandler, JobId,
    JobQueue, JobStatusView, JobSubmitter, MaintenanceHandler, MaintenanceScheduler,
    MaintenanceSchedulerHandle, MaintenanceTasks, QueueDepth, QueueError, StatusPoller,
    SubmitError, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats,
};
use crate::store::{
    InMemoryResultStore, Insight, JobStats, PostgresResultStore, ResultStore, Snapshot, StoreError,
};

/// Page size for snapshot and insight listings.
pub const DEFAULT_LIST_LIMIT: usize = 10;
pub const MAX_LIST_LIMIT: usize = 100;

fn list_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<SubmitError> for OrchestratorError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(msg) => Self::Validation(msg),
            SubmitError::NotFound(msg) => Self::NotFound(msg),
            SubmitError::QueueUnavailable(msg) => Self::QueueUnavailable(msg),
            SubmitError::Storage(msg) => Self::Storage(msg),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(e: QueueError) -> Self {
        Self::QueueUnavailable(e.to_string())
    }
}

/// Queue depth per category plus job counts per status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueOverview {
    pub queues: BTreeMap<JobCategory, QueueDepth>,
    pub jobs: JobStats,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    submitter: JobSubmitter,
    poller: StatusPoller,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        config: OrchestratorConfig,
    ) -> Self {
        let submitter = JobSubmitter::new(store.clone(), queue.clone(), cache.clone())
            .with_limits(config.attempts)
            .with_prompt_version(config.prompt_version.clone());
        let poller = StatusPoller::new(store.clone(), cache.clone());
        Self {
            store,
            queue,
            cache,
            submitter,
            poller,
            config,
        }
    }

    /// Everything in process; nothing survives a restart.
    pub fn in_memory(config: OrchestratorConfig) -> Self {
        let cache = ResultCache::new(
            Arc::new(InMemoryCache::new()),
            config.snapshot_cache_ttl,
            config.job_status_cache_ttl,
        );
        Self::new(
            InMemoryResultStore::arc(),
            InMemoryJobQueue::arc(config.visibility_timeout),
            cache,
            config,
        )
    }

    /// Pick backends from the config: Postgres when `DATABASE_URL` is set,
    /// Redis when `REDIS_URL` is set, in-memory otherwise.
    pub async fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let store: Arc<dyn ResultStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresResultStore::connect(url).await?;
                store.migrate().await?;
                info!("using postgres result store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; results are kept in memory only");
                InMemoryResultStore::arc()
            }
        };

        let (queue, cache) = Self::queue_and_cache(&config).await?;
        Ok(Self::new(store, queue, cache, config))
    }

    #[cfg(feature = "redis")]
    async fn queue_and_cache(
        config: &OrchestratorConfig,
    ) -> Result<(Arc<dyn JobQueue>, ResultCache), OrchestratorError> {
        use crate::cache::{Cache, RedisCache};
        use crate::jobs::RedisJobQueue;

        let Some(url) = &config.redis_url else {
            return Ok(Self::in_memory_queue_and_cache(config));
        };
        let queue = RedisJobQueue::connect(url, config.visibility_timeout).await?;
        let cache: Arc<dyn Cache> = Arc::new(
            RedisCache::new(url).map_err(|e| OrchestratorError::QueueUnavailable(e.to_string()))?,
        );
        info!("using redis queue and cache");
        Ok((
            Arc::new(queue),
            ResultCache::new(cache, config.snapshot_cache_ttl, config.job_status_cache_ttl),
        ))
    }

    #[cfg(not(feature = "redis"))]
    async fn queue_and_cache(
        config: &OrchestratorConfig,
    ) -> Result<(Arc<dyn JobQueue>, ResultCache), OrchestratorError> {
        if config.redis_url.is_some() {
            return Err(ConfigError::Inconsistent(
                "REDIS_URL is set but this build has no redis support".into(),
            )
            .into());
        }
        Ok(Self::in_memory_queue_and_cache(config))
    }

    fn in_memory_queue_and_cache(config: &OrchestratorConfig) -> (Arc<dyn JobQueue>, ResultCache) {
        (
            InMemoryJobQueue::arc(config.visibility_timeout),
            ResultCache::new(
                Arc::new(InMemoryCache::new()),
                config.snapshot_cache_ttl,
                config.job_status_cache_ttl,
            ),
        )
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn submitter(&self) -> &JobSubmitter {
        &self.submitter
    }

    pub async fn submit(&self, category: JobCategory, payload: &JsonValue) -> Result<JobId, OrchestratorError> {
        Ok(self.submitter.submit(category, payload).await?)
    }

    pub async fn submit_ingestion(&self, user_id: UserId, time_range: TimeRange) -> Result<JobId, OrchestratorError> {
        Ok(self.submitter.submit_ingestion(user_id, time_range).await?)
    }

    pub async fn submit_generation(
        &self,
        snapshot_id: SnapshotId,
        category: InsightCategory,
        tone: Option<Tone>,
    ) -> Result<JobId, OrchestratorError> {
        Ok(self
            .submitter
            .submit_generation(snapshot_id, category, tone)
            .await?)
    }

    pub async fn get_job_status(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        Ok(self.poller.get_status(job_id).await?)
    }

    /// Most recent first; `limit` defaults to 10 and is clamped to 1..=100.
    pub async fn list_snapshots(
        &self,
        user_id: UserId,
        time_range: Option<TimeRange>,
        limit: Option<usize>,
    ) -> Result<Vec<Snapshot>, OrchestratorError> {
        Ok(self
            .store
            .list_snapshots(user_id, time_range, list_limit(limit))
            .await?)
    }

    /// Newest first, same paging as [`Self::list_snapshots`].
    pub async fn list_insights(
        &self,
        user_id: UserId,
        category: Option<InsightCategory>,
        limit: Option<usize>,
    ) -> Result<Vec<Insight>, OrchestratorError> {
        Ok(self
            .store
            .list_insights(user_id, category, list_limit(limit))
            .await?)
    }

    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<Snapshot, OrchestratorError> {
        if let Some(snapshot) = self.cache.snapshot(id).await {
            return Ok(snapshot);
        }
        let snapshot = self
            .store
            .get_snapshot(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("snapshot {id}")))?;
        self.cache.put_snapshot(&snapshot).await;
        Ok(snapshot)
    }

    pub async fn get_insight(&self, id: InsightId) -> Result<Insight, OrchestratorError> {
        if let Some(insight) = self.cache.insight(id).await {
            return Ok(insight);
        }
        let insight = self
            .store
            .get_insight(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("insight {id}")))?;
        self.cache.put_insight(&insight).await;
        Ok(insight)
    }

    pub async fn queue_overview(&self) -> Result<QueueOverview, OrchestratorError> {
        let mut queues = BTreeMap::new();
        for category in JobCategory::ALL {
            queues.insert(category, self.queue.depth(category).await?);
        }
        Ok(QueueOverview {
            queues,
            jobs: self.store.job_stats().await?,
        })
    }

    /// Start the three worker pools and the maintenance scheduler.
    pub fn start(
        &self,
        source: Arc<dyn ListeningSource>,
        generator: Arc<dyn TextGenerator>,
    ) -> OrchestratorRuntime {
        let tasks = MaintenanceTasks::new(
            self.store.clone(),
            self.queue.clone(),
            self.cache.clone(),
            self.submitter.clone(),
            self.config.maintenance_settings(),
        );
        let handlers: [(JobCategory, Arc<dyn JobHandler>); 3] = [
            (JobCategory::Ingestion, Arc::new(IngestionHandler::new(source))),
            (
                JobCategory::Generation,
                Arc::new(GenerationHandler::new(self.store.clone(), generator)),
            ),
            (JobCategory::Maintenance, Arc::new(MaintenanceHandler::new(tasks))),
        ];

        let pools = handlers
            .into_iter()
            .map(|(category, handler)| {
                let config = WorkerPoolConfig::new(category)
                    .with_workers(self.config.workers(category))
                    .with_retry(self.config.retry_policy(category))
                    .with_call_timeout(self.config.external_call_timeout);
                WorkerPool::new(
                    self.store.clone(),
                    self.queue.clone(),
                    self.cache.clone(),
                    handler,
                    config,
                )
                .spawn()
            })
            .collect();

        let scheduler = MaintenanceScheduler::new(self.submitter.clone(), self.config.schedule()).spawn();
        OrchestratorRuntime { pools, scheduler }
    }
}

/// Running pools and scheduler.
#[derive(Debug)]
pub struct OrchestratorRuntime {
    pools: Vec<WorkerPoolHandle>,
    scheduler: MaintenanceSchedulerHandle,
}

impl OrchestratorRuntime {
    pub fn stats(&self) -> BTreeMap<JobCategory, WorkerStats> {
        self.pools.iter().map(|p| (p.category(), p.stats())).collect()
    }

    /// Stop the scheduler first so no new maintenance jobs arrive, then drain the pools.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        for pool in self.pools {
            pool.shutdown().await;
        }
    }
}
