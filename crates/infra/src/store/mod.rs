//! Result store: durable job, snapshot and insight records.
//!
//! ## Guarantees
//!
//! - Job transitions are conditional on the current status; terminal jobs are immutable.
//! - Snapshot writes upsert on `(user, captured_on, time_range)` and keep the original id.
//! - Insight writes insert-if-absent on `(snapshot, category, tone, prompt_version)`.
//! - A result write and its job's `succeeded` transition commit together or not at all.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use moodscope_core::{InsightCategory, InsightId, SnapshotId, TimeRange, Tone, UserId};
use moodscope_insights::AggregateMetrics;

use crate::jobs::types::{ErrorDetail, Job, JobId, JobStatus, ResultRef};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryResultStore;
pub use postgres::PostgresResultStore;

/// Aggregated listening data for one user, day and window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub user_id: UserId,
    pub captured_on: NaiveDate,
    pub time_range: TimeRange,
    pub metrics: AggregateMetrics,
    pub source_record_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            user_id: self.user_id,
            captured_on: self.captured_on,
            time_range: self.time_range,
        }
    }
}

/// Snapshot produced by an ingestion run, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub user_id: UserId,
    pub captured_on: NaiveDate,
    pub time_range: TimeRange,
    pub metrics: AggregateMetrics,
}

impl NewSnapshot {
    pub fn key(&self) -> SnapshotKey {
        SnapshotKey {
            user_id: self.user_id,
            captured_on: self.captured_on,
            time_range: self.time_range,
        }
    }
}

/// Natural key of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    pub user_id: UserId,
    pub captured_on: NaiveDate,
    pub time_range: TimeRange,
}

impl SnapshotKey {
    pub fn cache_key(&self) -> String {
        format!(
            "snapshot:{}:{}:{}",
            self.user_id, self.captured_on, self.time_range
        )
    }
}

/// Generated insight derived from exactly one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: InsightId,
    pub snapshot_id: SnapshotId,
    pub user_id: UserId,
    pub category: InsightCategory,
    pub tone: Tone,
    pub prompt_version: String,
    pub model: String,
    pub content: String,
    pub structured: JsonValue,
    pub generation_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl Insight {
    pub fn key(&self) -> InsightKey {
        InsightKey {
            snapshot_id: self.snapshot_id,
            category: self.category,
            tone: self.tone,
            prompt_version: self.prompt_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewInsight {
    pub snapshot_id: SnapshotId,
    pub user_id: UserId,
    pub category: InsightCategory,
    pub tone: Tone,
    pub prompt_version: String,
    pub model: String,
    pub content: String,
    pub structured: JsonValue,
    pub generation_ms: u64,
}

impl NewInsight {
    pub fn key(&self) -> InsightKey {
        InsightKey {
            snapshot_id: self.snapshot_id,
            category: self.category,
            tone: self.tone,
            prompt_version: self.prompt_version.clone(),
        }
    }
}

/// Natural key of an insight; identical keys never trigger a second generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InsightKey {
    pub snapshot_id: SnapshotId,
    pub category: InsightCategory,
    pub tone: Tone,
    pub prompt_version: String,
}

impl InsightKey {
    pub fn cache_key(&self) -> String {
        format!(
            "insight:{}:{}:{}:{}",
            self.snapshot_id, self.category, self.tone, self.prompt_version
        )
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// What a snapshot purge removed, so callers can invalidate caches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgedSnapshots {
    pub snapshots: Vec<(SnapshotId, SnapshotKey)>,
    pub insights: Vec<(InsightId, InsightKey)>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Persist a new job in whatever state it was built with.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Pending -> Running, incrementing `attempts`.
    ///
    /// Returns `None` when the job is unknown or not pending.
    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Running -> Pending with the error that caused the retry.
    async fn schedule_retry(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError>;

    /// Pending|Running -> Failed.
    async fn fail_job(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError>;

    /// Running -> Succeeded with an optional result reference.
    async fn complete_job(&self, job_id: JobId, result: Option<ResultRef>) -> Result<Job, StoreError>;

    /// Upsert the snapshot by natural key and mark the job succeeded, atomically.
    async fn complete_with_snapshot(
        &self,
        job_id: JobId,
        snapshot: NewSnapshot,
    ) -> Result<Snapshot, StoreError>;

    /// Insert the insight unless its natural key exists, then mark the job
    /// succeeded pointing at whichever row won, atomically.
    async fn complete_with_insight(
        &self,
        job_id: JobId,
        insight: NewInsight,
    ) -> Result<Insight, StoreError>;

    /// Bump `updated_at` of a non-terminal job.
    async fn touch_job(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Jobs in `status` not updated since `before`, oldest first.
    async fn stale_jobs(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Delete terminal jobs finished before `before`, returning their ids.
    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<Vec<JobId>, StoreError>;

    async fn job_stats(&self) -> Result<JobStats, StoreError>;

    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError>;

    async fn find_snapshot(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, StoreError>;

    /// Most recent first.
    async fn list_snapshots(
        &self,
        user_id: UserId,
        time_range: Option<TimeRange>,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// The newest snapshot of every user captured on or after `since`.
    async fn latest_snapshots_since(&self, since: NaiveDate) -> Result<Vec<Snapshot>, StoreError>;

    /// Delete snapshots captured before `before` and their insights.
    async fn purge_snapshots(&self, before: NaiveDate) -> Result<PurgedSnapshots, StoreError>;

    async fn get_insight(&self, id: InsightId) -> Result<Option<Insight>, StoreError>;

    async fn find_insight(&self, key: &InsightKey) -> Result<Option<Insight>, StoreError>;

    /// A user's insights, newest first, optionally of one category.
    async fn list_insights(
        &self,
        user_id: UserId,
        category: Option<InsightCategory>,
        limit: usize,
    ) -> Result<Vec<Insight>, StoreError>;
}
