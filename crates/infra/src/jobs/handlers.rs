//! Category handlers run by the worker pools.
//!
//! Handlers only compute; committing the result and moving the job to a
//! terminal state is the pool's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use moodscope_core::DomainError;
use moodscope_insights::{GenerationError, GenerationRequest, ListeningSource, SourceError, TextGenerator, compute_aggregate};

use super::submitter::SubmitError;
use super::types::{ErrorDetail, ErrorKind, Job, JobPayload, ResultRef};
use crate::store::{InsightKey, NewInsight, NewSnapshot, ResultStore, StoreError};

/// Why a job attempt did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Validation(String),
    #[error("external call failed, may succeed later: {0}")]
    Transient(String),
    #[error("external call failed permanently: {0}")]
    Permanent(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Validation(_) => ErrorKind::Validation,
            JobError::Transient(_) | JobError::Timeout(_) => ErrorKind::ExternalTransient,
            JobError::Permanent(_) => ErrorKind::ExternalPermanent,
            JobError::Storage(_) => ErrorKind::Storage,
            JobError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::new(self.kind(), self.to_string())
    }
}

impl From<SourceError> for JobError {
    fn from(e: SourceError) -> Self {
        if e.is_transient() {
            JobError::Transient(e.to_string())
        } else {
            JobError::Permanent(e.to_string())
        }
    }
}

impl From<GenerationError> for JobError {
    fn from(e: GenerationError) -> Self {
        if e.is_transient() {
            JobError::Transient(e.to_string())
        } else {
            JobError::Permanent(e.to_string())
        }
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => JobError::NotFound(msg),
            other => JobError::Storage(other.to_string()),
        }
    }
}

impl From<DomainError> for JobError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound(msg) => JobError::NotFound(msg),
            other => JobError::Validation(other.to_string()),
        }
    }
}

impl From<SubmitError> for JobError {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::Validation(msg) => JobError::Validation(msg),
            SubmitError::NotFound(msg) => JobError::NotFound(msg),
            SubmitError::QueueUnavailable(msg) => JobError::Transient(msg),
            SubmitError::Storage(msg) => JobError::Storage(msg),
        }
    }
}

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutput {
    Snapshot(NewSnapshot),
    Insight(NewInsight),
    /// The result already exists; nothing new to write.
    Existing(ResultRef),
    /// Side-effect only (maintenance).
    Done,
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<JobOutput, JobError>;
}

/// Fetches listening data and aggregates it into today's snapshot.
#[derive(Clone)]
pub struct IngestionHandler {
    source: Arc<dyn ListeningSource>,
}

impl IngestionHandler {
    pub fn new(source: Arc<dyn ListeningSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl JobHandler for IngestionHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutput, JobError> {
        let JobPayload::Ingest { user_id, time_range } = &job.payload else {
            return Err(JobError::Validation(format!(
                "ingestion worker got {} job",
                job.payload.category()
            )));
        };

        let records = self.source.fetch_listening_data(*user_id, *time_range).await?;
        let metrics = compute_aggregate(&records);
        debug!(
            job_id = %job.id,
            user_id = %user_id,
            tracks = metrics.source_record_count,
            "aggregated listening data"
        );

        Ok(JobOutput::Snapshot(NewSnapshot {
            user_id: *user_id,
            captured_on: Utc::now().date_naive(),
            time_range: *time_range,
            metrics,
        }))
    }
}

/// Turns a snapshot into an insight, unless that insight already exists.
#[derive(Clone)]
pub struct GenerationHandler {
    store: Arc<dyn ResultStore>,
    generator: Arc<dyn TextGenerator>,
}

impl GenerationHandler {
    pub fn new(store: Arc<dyn ResultStore>, generator: Arc<dyn TextGenerator>) -> Self {
        Self { store, generator }
    }
}

#[async_trait]
impl JobHandler for GenerationHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutput, JobError> {
        let JobPayload::Generate {
            snapshot_id,
            category,
            tone,
            prompt_version,
        } = &job.payload
        else {
            return Err(JobError::Validation(format!(
                "generation worker got {} job",
                job.payload.category()
            )));
        };

        let key = InsightKey {
            snapshot_id: *snapshot_id,
            category: *category,
            tone: *tone,
            prompt_version: prompt_version.clone(),
        };
        // A duplicate job may have won the race since submission.
        if let Some(existing) = self.store.find_insight(&key).await? {
            info!(job_id = %job.id, insight_id = %existing.id, "insight already generated");
            return Ok(JobOutput::Existing(ResultRef::Insight(existing.id)));
        }

        let snapshot = self
            .store
            .get_snapshot(*snapshot_id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("snapshot {snapshot_id}")))?;

        let request = GenerationRequest {
            metrics: snapshot.metrics,
            category: *category,
            tone: *tone,
            prompt_version: prompt_version.clone(),
        };
        let started = Instant::now();
        let payload = self.generator.generate(&request).await?;
        let generation_ms = started.elapsed().as_millis() as u64;

        Ok(JobOutput::Insight(NewInsight {
            snapshot_id: snapshot.id,
            user_id: snapshot.user_id,
            category: *category,
            tone: *tone,
            prompt_version: prompt_version.clone(),
            model: payload.model,
            content: payload.content,
            structured: payload.structured,
            generation_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moodscope_core::{InsightCategory, SnapshotId, TimeRange, Tone, UserId};
    use moodscope_insights::{SyntheticListeningSource, TemplateGenerator};
    use crate::store::InMemoryResultStore;

    #[test]
    fn error_kinds_follow_the_taxonomy() {
        let rate_limited: JobError = SourceError::RateLimited { retry_after_secs: Some(3) }.into();
        assert_eq!(rate_limited.kind(), ErrorKind::ExternalTransient);

        let expired: JobError = SourceError::AuthExpired.into();
        assert_eq!(expired.kind(), ErrorKind::ExternalPermanent);

        let bad_prompt: JobError = GenerationError::InvalidPrompt("x".into()).into();
        assert_eq!(bad_prompt.kind(), ErrorKind::ExternalPermanent);

        assert_eq!(JobError::Timeout(Duration::from_secs(1)).kind(), ErrorKind::ExternalTransient);

        let missing: JobError = StoreError::NotFound("snapshot".into()).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        let down: JobError = StoreError::Storage("io".into()).into();
        assert_eq!(down.kind(), ErrorKind::Storage);
    }

    #[tokio::test]
    async fn ingestion_builds_todays_snapshot() {
        let handler = IngestionHandler::new(Arc::new(SyntheticListeningSource::new()));
        let user = UserId::new();
        let job = Job::new(
            JobPayload::Ingest {
                user_id: user,
                time_range: TimeRange::ShortTerm,
            },
            3,
        );

        let JobOutput::Snapshot(snapshot) = handler.handle(&job).await.unwrap() else {
            panic!("expected a snapshot");
        };
        assert_eq!(snapshot.user_id, user);
        assert_eq!(snapshot.time_range, TimeRange::ShortTerm);
        assert_eq!(snapshot.captured_on, Utc::now().date_naive());
        assert_eq!(snapshot.metrics.source_record_count, 50);
    }

    #[tokio::test]
    async fn handler_rejects_payload_of_another_category() {
        let handler = IngestionHandler::new(Arc::new(SyntheticListeningSource::new()));
        let job = Job::new(
            JobPayload::Maintenance {
                task: super::super::types::MaintenanceTask::CleanupJobs,
            },
            1,
        );
        let err = handler.handle(&job).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn generation_for_missing_snapshot_is_not_found() {
        let handler = GenerationHandler::new(
            InMemoryResultStore::arc(),
            Arc::new(TemplateGenerator::new()),
        );
        let job = Job::new(
            JobPayload::Generate {
                snapshot_id: SnapshotId::new(),
                category: InsightCategory::Wellness,
                tone: Tone::Neutral,
                prompt_version: "v1.0".into(),
            },
            3,
        );
        let err = handler.handle(&job).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
