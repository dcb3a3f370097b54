//! Read-only job status queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ErrorDetail, Job, JobCategory, JobId, JobStatus, ResultRef};
use crate::cache::ResultCache;
use crate::store::{ResultStore, StoreError};

/// Client-visible job state. `NotFound` means the id is unknown, not that the job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotFound,
}

impl From<JobStatus> for JobState {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => JobState::Pending,
            JobStatus::Running => JobState::Running,
            JobStatus::Succeeded => JobState::Succeeded,
            JobStatus::Failed => JobState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<JobCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobStatusView {
    pub fn not_found(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::NotFound,
            category: None,
            result: None,
            error: None,
            attempts: 0,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Succeeded | JobState::Failed)
    }
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            state: job.status.into(),
            category: Some(job.category),
            result: job.result,
            error: job.error.clone(),
            attempts: job.attempts,
            created_at: Some(job.created_at),
            updated_at: Some(job.updated_at),
        }
    }
}

#[derive(Clone)]
pub struct StatusPoller {
    store: Arc<dyn ResultStore>,
    cache: ResultCache,
}

impl StatusPoller {
    pub fn new(store: Arc<dyn ResultStore>, cache: ResultCache) -> Self {
        Self { store, cache }
    }

    /// Current state of `job_id`. Terminal states are served from cache when present.
    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatusView, StoreError> {
        if let Some(job) = self.cache.job(job_id).await {
            return Ok(JobStatusView::from(&job));
        }

        match self.store.get_job(job_id).await? {
            Some(job) => {
                self.cache.put_job(&job).await;
                Ok(JobStatusView::from(&job))
            }
            None => Ok(JobStatusView::not_found(job_id)),
        }
    }
}
