//! Job submission: validate, record, enqueue, return.
//!
//! The submitter never waits for execution. Generation requests whose insight
//! already exists are answered from the store without enqueueing anything.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use moodscope_core::{DomainError, InsightCategory, SnapshotId, TimeRange, Tone, UserId};

use super::queue::{JobQueue, QueueMessage};
use super::types::{ErrorDetail, ErrorKind, Job, JobCategory, JobId, JobPayload, MaintenanceTask, ResultRef};
use crate::cache::ResultCache;
use crate::store::{InsightKey, ResultStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for SubmitError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound(msg) => SubmitError::NotFound(msg),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => SubmitError::Validation(msg),
        }
    }
}

impl From<StoreError> for SubmitError {
    fn from(e: StoreError) -> Self {
        SubmitError::Storage(e.to_string())
    }
}

/// Body of an ingestion submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub time_range: TimeRange,
}

/// Body of a generation submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateRequest {
    pub snapshot_id: SnapshotId,
    pub category: InsightCategory,
    #[serde(default)]
    pub tone: Option<Tone>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceRequest {
    pub task: MaintenanceTask,
}

/// Attempt bound per category, first try included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
    pub ingestion: u32,
    pub generation: u32,
    pub maintenance: u32,
}

impl Default for AttemptLimits {
    fn default() -> Self {
        Self {
            ingestion: 3,
            generation: 3,
            maintenance: 2,
        }
    }
}

impl AttemptLimits {
    pub fn for_category(&self, category: JobCategory) -> u32 {
        match category {
            JobCategory::Ingestion => self.ingestion,
            JobCategory::Generation => self.generation,
            JobCategory::Maintenance => self.maintenance,
        }
    }
}

#[derive(Clone)]
pub struct JobSubmitter {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    limits: AttemptLimits,
    prompt_version: String,
}

impl JobSubmitter {
    pub fn new(store: Arc<dyn ResultStore>, queue: Arc<dyn JobQueue>, cache: ResultCache) -> Self {
        Self {
            store,
            queue,
            cache,
            limits: AttemptLimits::default(),
            prompt_version: "v1.0".to_string(),
        }
    }

    pub fn with_limits(mut self, limits: AttemptLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_prompt_version(mut self, prompt_version: impl Into<String>) -> Self {
        self.prompt_version = prompt_version.into();
        self
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    /// Submit an untyped payload, validating its shape against `category`.
    pub async fn submit(&self, category: JobCategory, payload: &JsonValue) -> Result<JobId, SubmitError> {
        match category {
            JobCategory::Ingestion => {
                let req: IngestRequest = parse_body(payload)?;
                self.submit_ingestion(req.user_id, req.time_range).await
            }
            JobCategory::Generation => {
                let req: GenerateRequest = parse_body(payload)?;
                self.submit_generation(req.snapshot_id, req.category, req.tone)
                    .await
            }
            JobCategory::Maintenance => {
                let req: MaintenanceRequest = parse_body(payload)?;
                self.submit_maintenance(req.task).await
            }
        }
    }

    pub async fn submit_ingestion(&self, user_id: UserId, time_range: TimeRange) -> Result<JobId, SubmitError> {
        self.enqueue(JobPayload::Ingest { user_id, time_range }).await
    }

    /// Submit a generation, or answer it immediately if the insight exists.
    pub async fn submit_generation(
        &self,
        snapshot_id: SnapshotId,
        category: InsightCategory,
        tone: Option<Tone>,
    ) -> Result<JobId, SubmitError> {
        let tone = category.resolve_tone(tone)?;

        let snapshot_known = self.cache.snapshot(snapshot_id).await.is_some()
            || self.store.get_snapshot(snapshot_id).await?.is_some();
        if !snapshot_known {
            return Err(SubmitError::NotFound(format!("snapshot {snapshot_id}")));
        }

        let payload = JobPayload::Generate {
            snapshot_id,
            category,
            tone,
            prompt_version: self.prompt_version.clone(),
        };
        let key = InsightKey {
            snapshot_id,
            category,
            tone,
            prompt_version: self.prompt_version.clone(),
        };

        let existing = match self.cache.insight_by_key(&key).await {
            Some(insight) => Some(insight),
            None => {
                let found = self.store.find_insight(&key).await?;
                if let Some(insight) = &found {
                    self.cache.put_insight(insight).await;
                }
                found
            }
        };

        if let Some(insight) = existing {
            let job = Job::already_succeeded(payload, ResultRef::Insight(insight.id));
            self.store.insert_job(&job).await?;
            self.cache.put_job(&job).await;
            info!(
                job_id = %job.id,
                insight_id = %insight.id,
                "generation answered from existing insight"
            );
            return Ok(job.id);
        }

        self.enqueue(payload).await
    }

    pub async fn submit_maintenance(&self, task: MaintenanceTask) -> Result<JobId, SubmitError> {
        self.enqueue(JobPayload::Maintenance { task }).await
    }

    /// Record a pending job, then push it. A failed push fails the job too.
    async fn enqueue(&self, payload: JobPayload) -> Result<JobId, SubmitError> {
        let category = payload.category();
        let job = Job::new(payload, self.limits.for_category(category));
        self.store.insert_job(&job).await?;

        let message = QueueMessage::new(job.id, job.payload.clone());
        if let Err(e) = self.queue.push(message).await {
            warn!(job_id = %job.id, category = %category, error = %e, "enqueue failed");
            let detail = ErrorDetail::new(ErrorKind::QueueUnavailable, e.to_string());
            match self.store.fail_job(job.id, detail).await {
                Ok(failed) => self.cache.put_job(&failed).await,
                Err(store_err) => {
                    warn!(job_id = %job.id, error = %store_err, "could not fail unqueued job")
                }
            }
            return Err(SubmitError::QueueUnavailable(e.to_string()));
        }

        info!(job_id = %job.id, category = %category, "job submitted");
        Ok(job.id)
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(payload: &JsonValue) -> Result<T, SubmitError> {
    T::deserialize(payload).map_err(|e| SubmitError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::queue::InMemoryJobQueue;
    use crate::jobs::types::JobStatus;
    use crate::store::InMemoryResultStore;
    use serde_json::json;
    use std::time::Duration;

    fn submitter() -> (JobSubmitter, Arc<InMemoryResultStore>, Arc<InMemoryJobQueue>) {
        let store = InMemoryResultStore::arc();
        let queue = InMemoryJobQueue::arc(Duration::from_secs(60));
        let submitter = JobSubmitter::new(store.clone(), queue.clone(), ResultCache::in_memory());
        (submitter, store, queue)
    }

    #[tokio::test]
    async fn ingestion_is_recorded_pending_and_enqueued() {
        let (submitter, store, queue) = submitter();
        let user = UserId::new();

        let job_id = submitter
            .submit(JobCategory::Ingestion, &json!({ "user_id": user }))
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(
            job.payload,
            JobPayload::Ingest {
                user_id: user,
                time_range: TimeRange::MediumTerm
            }
        );

        let delivery = queue
            .pull(JobCategory::Ingestion, "t", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.job_id, job_id);
    }

    #[tokio::test]
    async fn malformed_payloads_are_rejected_before_anything_is_written() {
        let (submitter, store, _) = submitter();

        for (category, body) in [
            (JobCategory::Ingestion, json!({})),
            (JobCategory::Ingestion, json!({ "user_id": "nope" })),
            (JobCategory::Ingestion, json!({ "user_id": UserId::new(), "time_range": "forever" })),
            (JobCategory::Generation, json!({ "snapshot_id": SnapshotId::new() })),
            (JobCategory::Maintenance, json!({ "task": "defragment" })),
        ] {
            let err = submitter.submit(category, &body).await.unwrap_err();
            assert!(matches!(err, SubmitError::Validation(_)), "{body}: {err:?}");
        }
        assert_eq!(store.job_stats().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn tone_must_fit_category() {
        let (submitter, _, _) = submitter();
        let err = submitter
            .submit_generation(SnapshotId::new(), InsightCategory::Roast, Some(Tone::Supportive))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
    }

    #[tokio::test]
    async fn generation_for_unknown_snapshot_is_not_found() {
        let (submitter, _, _) = submitter();
        let err = submitter
            .submit_generation(SnapshotId::new(), InsightCategory::Wellness, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::NotFound(_)));
    }

    #[tokio::test]
    async fn closed_queue_fails_the_job_and_reports_unavailable() {
        let (submitter, store, queue) = submitter();
        queue.close();

        let err = submitter
            .submit_ingestion(UserId::new(), TimeRange::ShortTerm)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::QueueUnavailable(_)));

        let stats = store.job_stats().await.unwrap();
        assert_eq!((stats.pending, stats.failed), (0, 1));
        let failed = store
            .stale_jobs(JobStatus::Failed, chrono::Utc::now() + chrono::Duration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(failed[0].error.as_ref().unwrap().kind, ErrorKind::QueueUnavailable);
    }
}
