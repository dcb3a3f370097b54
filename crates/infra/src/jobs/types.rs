//! Core job types and policies.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use moodscope_core::{DomainError, InsightCategory, InsightId, SnapshotId, TimeRange, Tone, UserId};

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::from_str(s)
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("JobId: {e}")))
    }
}

/// Work category; each has its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobCategory {
    Ingestion,
    Generation,
    Maintenance,
}

impl JobCategory {
    pub const ALL: [JobCategory; 3] = [Self::Ingestion, Self::Generation, Self::Maintenance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Generation => "generation",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for JobCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job category '{s}'")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished with a result reference (or nothing, for maintenance)
    Succeeded,
    /// Finished with error detail; no further retries
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

/// Recurring housekeeping run by the maintenance pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Requeue or fail jobs stuck past the staleness threshold.
    ReconcileStale,
    /// Delete terminal job records past retention.
    CleanupJobs,
    /// Delete old snapshots together with their insights.
    CleanupSnapshots,
    /// Submit a wellness insight for every recently active user.
    WeeklySummaries,
    /// Refresh medium-term listening data for every known user.
    DailyIngest,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReconcileStale => "reconcile_stale",
            Self::CleanupJobs => "cleanup_jobs",
            Self::CleanupSnapshots => "cleanup_snapshots",
            Self::WeeklySummaries => "weekly_summaries",
            Self::DailyIngest => "daily_ingest",
        }
    }
}

/// Validated job input, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Ingest {
        user_id: UserId,
        time_range: TimeRange,
    },
    Generate {
        snapshot_id: SnapshotId,
        category: InsightCategory,
        tone: Tone,
        prompt_version: String,
    },
    Maintenance {
        task: MaintenanceTask,
    },
}

impl JobPayload {
    pub fn category(&self) -> JobCategory {
        match self {
            JobPayload::Ingest { .. } => JobCategory::Ingestion,
            JobPayload::Generate { .. } => JobCategory::Generation,
            JobPayload::Maintenance { .. } => JobCategory::Maintenance,
        }
    }
}

/// Weak reference from a job to the entity it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ResultRef {
    Snapshot(SnapshotId),
    Insight(InsightId),
}

impl ResultRef {
    pub fn kind(&self) -> &'static str {
        match self {
            ResultRef::Snapshot(_) => "snapshot",
            ResultRef::Insight(_) => "insight",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            ResultRef::Snapshot(id) => *id.as_uuid(),
            ResultRef::Insight(id) => *id.as_uuid(),
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "snapshot" => Some(Self::Snapshot(SnapshotId::from_uuid(id))),
            "insight" => Some(Self::Insight(InsightId::from_uuid(id))),
            _ => None,
        }
    }
}

/// Failure classification recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input; never retried.
    Validation,
    /// Rate limited, unavailable or timed out; retried with backoff.
    ExternalTransient,
    /// Auth expired or invalid prompt; not retried.
    ExternalPermanent,
    /// Result store write failed.
    Storage,
    /// Referenced entity does not exist.
    NotFound,
    /// The reconciliation sweep gave up on a job whose worker vanished.
    WorkerLost,
    /// The job record was written but its message could not be enqueued.
    QueueUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ExternalTransient => "external_transient",
            Self::ExternalPermanent => "external_permanent",
            Self::Storage => "storage",
            Self::NotFound => "not_found",
            Self::WorkerLost => "worker_lost",
            Self::QueueUnavailable => "queue_unavailable",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Validation,
            Self::ExternalTransient,
            Self::ExternalPermanent,
            Self::Storage,
            Self::NotFound,
            Self::WorkerLost,
            Self::QueueUnavailable,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| DomainError::validation(format!("unknown error kind '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) applied symmetrically around the delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(30), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Create a policy that runs a job exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff and 10% jitter.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    ///
    /// Never exceeds `max_delay`, jitter included.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            // deterministic per attempt
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A unit of asynchronous work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub category: JobCategory,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub result: Option<ResultRef>,
    pub error: Option<ErrorDetail>,
    /// Attempts started so far (incremented on every claim).
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            category: payload.category(),
            payload,
            status: JobStatus::Pending,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// A job that is already answered by an existing result; it never runs.
    pub fn already_succeeded(payload: JobPayload, result: ResultRef) -> Self {
        let mut job = Self::new(payload, 0);
        job.status = JobStatus::Succeeded;
        job.result = Some(result);
        job.finished_at = Some(job.created_at);
        job
    }

    /// Pending -> Running.
    pub fn mark_running(&mut self) {
        let now = Utc::now();
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Running -> Pending, remembering why the last attempt failed.
    pub fn mark_retry(&mut self, error: ErrorDetail) {
        self.status = JobStatus::Pending;
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    pub fn mark_succeeded(&mut self, result: Option<ResultRef>) {
        let now = Utc::now();
        self.status = JobStatus::Succeeded;
        self.result = result;
        self.error = None;
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    pub fn mark_failed(&mut self, error: ErrorDetail) {
        let now = Utc::now();
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.updated_at = now;
        self.finished_at = Some(now);
    }

    /// Bump `updated_at` without changing state.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingest() -> JobPayload {
        JobPayload::Ingest {
            user_id: UserId::new(),
            time_range: TimeRange::MediumTerm,
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(500))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_ten_percent_and_below_cap() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(30), Duration::from_secs(300));
        for attempt in 1..=6 {
            let nominal = (30_000f64 * 2f64.powi(attempt as i32 - 1)).min(300_000.0);
            let got = policy.delay_for_attempt(attempt).as_millis() as f64;
            assert!((got - nominal).abs() <= nominal * 0.1 + 1.0, "attempt {attempt}: {got}");
            assert!(got <= 300_000.0);
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_counts_the_first_attempt() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(ingest(), 3);
        assert_eq!(job.category, JobCategory::Ingestion);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);

        job.mark_retry(ErrorDetail::new(ErrorKind::ExternalTransient, "rate limited"));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.status.is_terminal());

        job.mark_running();
        let snapshot = SnapshotId::new();
        job.mark_succeeded(Some(ResultRef::Snapshot(snapshot)));
        assert!(job.status.is_terminal());
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error, None);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = JobPayload::Maintenance {
            task: MaintenanceTask::ReconcileStale,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "maintenance", "task": "reconcile_stale"}));
        assert_eq!(payload.category(), JobCategory::Maintenance);
    }

    #[test]
    fn result_ref_round_trips_through_parts() {
        let r = ResultRef::Insight(InsightId::new());
        assert_eq!(ResultRef::from_parts(r.kind(), r.id()), Some(r));
        assert_eq!(ResultRef::from_parts("job", Uuid::nil()), None);
    }
}
