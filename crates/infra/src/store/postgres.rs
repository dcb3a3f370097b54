//! Postgres-backed result store.
//!
//! Jobs, snapshots and insights live in three tables. Natural keys are unique
//! constraints, so concurrent duplicate work collapses at the database:
//!
//! | Table | Unique key | Write |
//! |-------|-----------|-------|
//! | `snapshots` | `(user_id, captured_on, time_range)` | `ON CONFLICT DO UPDATE`, id kept |
//! | `insights` | `(snapshot_id, category, tone, prompt_version)` | `ON CONFLICT DO NOTHING`, existing row returned |
//!
//! Job transitions are `UPDATE ... WHERE status IN (...)`; zero affected rows
//! means the transition is illegal (or the job is gone).
//!
//! ## Error Mapping
//!
//! | SQLx Error | Code | StoreError |
//! |------------|------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use moodscope_core::{InsightCategory, InsightId, SnapshotId, TimeRange, UserId};
use moodscope_insights::AggregateMetrics;

use super::{
    Insight, InsightKey, JobStats, NewInsight, NewSnapshot, PurgedSnapshots, ResultStore,
    Snapshot, SnapshotKey, StoreError,
};
use crate::jobs::types::{ErrorDetail, ErrorKind, Job, JobCategory, JobId, JobPayload, JobStatus, ResultRef};

/// Schema applied by [`PostgresResultStore::migrate`]. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              UUID PRIMARY KEY,
    category        TEXT NOT NULL,
    payload         JSONB NOT NULL,
    status          TEXT NOT NULL,
    result_type     TEXT,
    result_id       UUID,
    error_kind      TEXT,
    error_message   TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS jobs_status_updated_at ON jobs (status, updated_at);

CREATE TABLE IF NOT EXISTS snapshots (
    id                   UUID PRIMARY KEY,
    user_id              UUID NOT NULL,
    captured_on          DATE NOT NULL,
    time_range           TEXT NOT NULL,
    metrics              JSONB NOT NULL,
    source_record_count  INTEGER NOT NULL,
    created_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (user_id, captured_on, time_range)
);
CREATE INDEX IF NOT EXISTS snapshots_user_captured ON snapshots (user_id, captured_on DESC);

CREATE TABLE IF NOT EXISTS insights (
    id              UUID PRIMARY KEY,
    snapshot_id     UUID NOT NULL REFERENCES snapshots (id) ON DELETE CASCADE,
    user_id         UUID NOT NULL,
    category        TEXT NOT NULL,
    tone            TEXT NOT NULL,
    prompt_version  TEXT NOT NULL,
    model           TEXT NOT NULL,
    content         TEXT NOT NULL,
    structured      JSONB NOT NULL,
    generation_ms   BIGINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (snapshot_id, category, tone, prompt_version)
);

CREATE INDEX IF NOT EXISTS insights_user_created ON insights (user_id, created_at DESC);
"#;

const JOB_COLUMNS: &str = "id, category, payload, status, result_type, result_id, error_kind, \
    error_message, attempts, max_attempts, created_at, updated_at, started_at, finished_at";

const SNAPSHOT_COLUMNS: &str =
    "id, user_id, captured_on, time_range, metrics, source_record_count, created_at, updated_at";

const INSIGHT_COLUMNS: &str = "id, snapshot_id, user_id, category, tone, prompt_version, model, \
    content, structured, generation_ms, created_at";

#[derive(Debug, Clone)]
pub struct PostgresResultStore {
    pool: Arc<PgPool>,
}

impl PostgresResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool sized for one orchestrator process.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Transition a job inside `tx`, failing if it is not in one of `from`.
    async fn transition(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        result: Option<ResultRef>,
        error: Option<&ErrorDetail>,
    ) -> Result<Job, StoreError> {
        let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let finished = to.is_terminal();
        let sql = format!(
            r#"
            UPDATE jobs SET
                status = $2,
                result_type = COALESCE($3, result_type),
                result_id = COALESCE($4, result_id),
                error_kind = CASE WHEN $2 = 'succeeded' THEN NULL ELSE COALESCE($5, error_kind) END,
                error_message = CASE WHEN $2 = 'succeeded' THEN NULL ELSE COALESCE($6, error_message) END,
                updated_at = NOW(),
                finished_at = CASE WHEN $7 THEN NOW() ELSE finished_at END
            WHERE id = $1 AND status = ANY($8)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(to.as_str())
            .bind(result.map(|r| r.kind()))
            .bind(result.map(|r| r.id()))
            .bind(error.map(|e| e.kind.as_str()))
            .bind(error.map(|e| e.message.as_str()))
            .bind(finished)
            .bind(&from)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("transition_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let current = sqlx::query("SELECT status FROM jobs WHERE id = $1")
                    .bind(job_id.as_uuid())
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(|e| map_sqlx_error("transition_job", e))?;
                match current {
                    Some(row) => {
                        let status: String = row
                            .try_get("status")
                            .map_err(|e| map_sqlx_error("transition_job", e))?;
                        Err(StoreError::InvalidTransition {
                            job_id,
                            from: parse_field(&status)?,
                            to,
                        })
                    }
                    None => Err(StoreError::NotFound(format!("job {job_id}"))),
                }
            }
        }
    }

    async fn single_transition(
        &self,
        job_id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        result: Option<ResultRef>,
        error: Option<&ErrorDetail>,
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let job = Self::transition(&mut tx, job_id, from, to, result, error).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }
}

#[async_trait]
impl ResultStore for PostgresResultStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, category = %job.category), err)]
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_value(&job.payload)
            .map_err(|e| StoreError::Corrupt(format!("job payload: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, category, payload, status, result_type, result_id, error_kind,
                error_message, attempts, max_attempts, created_at, updated_at,
                started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.category.as_str())
        .bind(&payload)
        .bind(job.status.as_str())
        .bind(job.result.map(|r| r.kind()))
        .bind(job.result.map(|r| r.id()))
        .bind(job.error.as_ref().map(|e| e.kind.as_str()))
        .bind(job.error.as_ref().map(|e| e.message.as_str()))
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status = 'running',
                attempts = attempts + 1,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn schedule_retry(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError> {
        self.single_transition(
            job_id,
            &[JobStatus::Running],
            JobStatus::Pending,
            None,
            Some(&error),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn fail_job(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError> {
        self.single_transition(
            job_id,
            &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Failed,
            None,
            Some(&error),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn complete_job(&self, job_id: JobId, result: Option<ResultRef>) -> Result<Job, StoreError> {
        self.single_transition(
            job_id,
            &[JobStatus::Running],
            JobStatus::Succeeded,
            result,
            None,
        )
        .await
    }

    #[instrument(
        skip(self, snapshot),
        fields(user_id = %snapshot.user_id, captured_on = %snapshot.captured_on),
        err
    )]
    async fn complete_with_snapshot(
        &self,
        job_id: JobId,
        snapshot: NewSnapshot,
    ) -> Result<Snapshot, StoreError> {
        let metrics = serde_json::to_value(&snapshot.metrics)
            .map_err(|e| StoreError::Corrupt(format!("snapshot metrics: {e}")))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO snapshots (id, user_id, captured_on, time_range, metrics, source_record_count)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, captured_on, time_range)
            DO UPDATE SET
                metrics = EXCLUDED.metrics,
                source_record_count = EXCLUDED.source_record_count,
                updated_at = NOW()
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        ))
        .bind(*SnapshotId::new().as_uuid())
        .bind(snapshot.user_id.as_uuid())
        .bind(snapshot.captured_on)
        .bind(snapshot.time_range.as_str())
        .bind(&metrics)
        .bind(snapshot.metrics.source_record_count as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_snapshot", e))?;
        let stored = snapshot_from_row(&row)?;

        Self::transition(
            &mut tx,
            job_id,
            &[JobStatus::Running],
            JobStatus::Succeeded,
            Some(ResultRef::Snapshot(stored.id)),
            None,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(
        skip(self, insight),
        fields(snapshot_id = %insight.snapshot_id, category = %insight.category, tone = %insight.tone),
        err
    )]
    async fn complete_with_insight(
        &self,
        job_id: JobId,
        insight: NewInsight,
    ) -> Result<Insight, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO insights (
                id, snapshot_id, user_id, category, tone, prompt_version, model,
                content, structured, generation_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (snapshot_id, category, tone, prompt_version) DO NOTHING
            RETURNING {INSIGHT_COLUMNS}
            "#
        ))
        .bind(*InsightId::new().as_uuid())
        .bind(insight.snapshot_id.as_uuid())
        .bind(insight.user_id.as_uuid())
        .bind(insight.category.as_str())
        .bind(insight.tone.as_str())
        .bind(&insight.prompt_version)
        .bind(&insight.model)
        .bind(&insight.content)
        .bind(&insight.structured)
        .bind(insight.generation_ms as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_insight", e))?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query(&format!(
                r#"
                SELECT {INSIGHT_COLUMNS} FROM insights
                WHERE snapshot_id = $1 AND category = $2 AND tone = $3 AND prompt_version = $4
                "#
            ))
            .bind(insight.snapshot_id.as_uuid())
            .bind(insight.category.as_str())
            .bind(insight.tone.as_str())
            .bind(&insight.prompt_version)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_existing_insight", e))?,
        };
        let stored = insight_from_row(&row)?;

        Self::transition(
            &mut tx,
            job_id,
            &[JobStatus::Running],
            JobStatus::Succeeded,
            Some(ResultRef::Insight(stored.id)),
            None,
        )
        .await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), err)]
    async fn touch_job(&self, job_id: JobId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET updated_at = NOW() WHERE id = $1 AND status IN ('pending', 'running')",
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("touch_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn stale_jobs(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stale_jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('succeeded', 'failed')
                AND COALESCE(finished_at, updated_at) < $1
            RETURNING id
            "#,
        )
        .bind(before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_jobs", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| map_sqlx_error("purge_jobs", e))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job_stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("job_stats", e))?;
            let total = total.max(0) as u64;
            match parse_field::<JobStatus>(&status)? {
                JobStatus::Pending => stats.pending = total,
                JobStatus::Running => stats.running = total,
                JobStatus::Succeeded => stats.succeeded = total,
                JobStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_snapshot", e))?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_snapshot(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS} FROM snapshots
            WHERE user_id = $1 AND captured_on = $2 AND time_range = $3
            "#
        ))
        .bind(key.user_id.as_uuid())
        .bind(key.captured_on)
        .bind(key.time_range.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_snapshot", e))?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_snapshots(
        &self,
        user_id: UserId,
        time_range: Option<TimeRange>,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS} FROM snapshots
            WHERE user_id = $1 AND ($2::text IS NULL OR time_range = $2)
            ORDER BY captured_on DESC, updated_at DESC
            LIMIT $3
            "#
        ))
        .bind(user_id.as_uuid())
        .bind(time_range.map(|r| r.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_snapshots", e))?;
        rows.iter().map(snapshot_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn latest_snapshots_since(&self, since: NaiveDate) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT ON (user_id) {SNAPSHOT_COLUMNS} FROM snapshots
            WHERE captured_on >= $1
            ORDER BY user_id, captured_on DESC, updated_at DESC
            "#
        ))
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_snapshots_since", e))?;
        rows.iter().map(snapshot_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn purge_snapshots(&self, before: NaiveDate) -> Result<PurgedSnapshots, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Collect the cascade victims first so callers can invalidate their cache keys.
        let insight_rows = sqlx::query(
            r#"
            SELECT i.id, i.snapshot_id, i.category, i.tone, i.prompt_version
            FROM insights i JOIN snapshots s ON s.id = i.snapshot_id
            WHERE s.captured_on < $1
            "#,
        )
        .bind(before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_snapshots", e))?;

        let mut purged = PurgedSnapshots::default();
        for row in &insight_rows {
            let id: Uuid = row.try_get("id").map_err(|e| map_sqlx_error("purge_snapshots", e))?;
            let key = insight_key_from_row(row)?;
            purged.insights.push((InsightId::from_uuid(id), key));
        }

        let snapshot_rows = sqlx::query(
            r#"
            DELETE FROM snapshots WHERE captured_on < $1
            RETURNING id, user_id, captured_on, time_range
            "#,
        )
        .bind(before)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("purge_snapshots", e))?;

        for row in &snapshot_rows {
            let map = |e| map_sqlx_error("purge_snapshots", e);
            let id: Uuid = row.try_get("id").map_err(map)?;
            let user_id: Uuid = row.try_get("user_id").map_err(map)?;
            let captured_on: NaiveDate = row.try_get("captured_on").map_err(map)?;
            let time_range: String = row.try_get("time_range").map_err(map)?;
            purged.snapshots.push((
                SnapshotId::from_uuid(id),
                SnapshotKey {
                    user_id: UserId::from_uuid(user_id),
                    captured_on,
                    time_range: parse_field(&time_range)?,
                },
            ));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(purged)
    }

    #[instrument(skip(self), err)]
    async fn get_insight(&self, id: InsightId) -> Result<Option<Insight>, StoreError> {
        let row = sqlx::query(&format!("SELECT {INSIGHT_COLUMNS} FROM insights WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_insight", e))?;
        row.as_ref().map(insight_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_insight(&self, key: &InsightKey) -> Result<Option<Insight>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {INSIGHT_COLUMNS} FROM insights
            WHERE snapshot_id = $1 AND category = $2 AND tone = $3 AND prompt_version = $4
            "#
        ))
        .bind(key.snapshot_id.as_uuid())
        .bind(key.category.as_str())
        .bind(key.tone.as_str())
        .bind(&key.prompt_version)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_insight", e))?;
        row.as_ref().map(insight_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_insights(
        &self,
        user_id: UserId,
        category: Option<InsightCategory>,
        limit: usize,
    ) -> Result<Vec<Insight>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {INSIGHT_COLUMNS} FROM insights
            WHERE user_id = $1 AND ($2::text IS NULL OR category = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(user_id.as_uuid())
        .bind(category.map(|c| c.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_insights", e))?;
        rows.iter().map(insight_from_row).collect()
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Corrupt(format!("bad row in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn parse_field<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(format!("{raw:?}: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    category: String,
    payload: serde_json::Value,
    status: String,
    result_type: Option<String>,
    result_id: Option<Uuid>,
    error_kind: Option<String>,
    error_message: Option<String>,
    attempts: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            category: row.try_get("category")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            result_type: row.try_get("result_type")?,
            result_id: row.try_get("result_id")?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let payload: JobPayload = serde_json::from_value(row.payload)
            .map_err(|e| StoreError::Corrupt(format!("job {} payload: {e}", row.id)))?;
        let category: JobCategory = parse_field(&row.category)?;
        let result = match (row.result_type.as_deref(), row.result_id) {
            (Some(kind), Some(id)) => Some(
                ResultRef::from_parts(kind, id)
                    .ok_or_else(|| StoreError::Corrupt(format!("result type {kind:?}")))?,
            ),
            _ => None,
        };
        let error = match row.error_kind.as_deref() {
            Some(kind) => Some(ErrorDetail::new(
                parse_field::<ErrorKind>(kind)?,
                row.error_message.unwrap_or_default(),
            )),
            None => None,
        };
        Ok(Job {
            id: JobId::from_uuid(row.id),
            category,
            payload,
            status: parse_field(&row.status)?,
            result,
            error,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map_err(|e| map_sqlx_error("decode_job", e))?
        .try_into()
}

#[derive(Debug)]
struct SnapshotRow {
    id: Uuid,
    user_id: Uuid,
    captured_on: NaiveDate,
    time_range: String,
    metrics: serde_json::Value,
    source_record_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            captured_on: row.try_get("captured_on")?,
            time_range: row.try_get("time_range")?,
            metrics: row.try_get("metrics")?,
            source_record_count: row.try_get("source_record_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot, StoreError> {
    let row = SnapshotRow::from_row(row).map_err(|e| map_sqlx_error("decode_snapshot", e))?;
    let metrics: AggregateMetrics = serde_json::from_value(row.metrics)
        .map_err(|e| StoreError::Corrupt(format!("snapshot {} metrics: {e}", row.id)))?;
    Ok(Snapshot {
        id: SnapshotId::from_uuid(row.id),
        user_id: UserId::from_uuid(row.user_id),
        captured_on: row.captured_on,
        time_range: parse_field(&row.time_range)?,
        metrics,
        source_record_count: row.source_record_count.max(0) as u32,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[derive(Debug)]
struct InsightRow {
    id: Uuid,
    snapshot_id: Uuid,
    user_id: Uuid,
    category: String,
    tone: String,
    prompt_version: String,
    model: String,
    content: String,
    structured: serde_json::Value,
    generation_ms: i64,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for InsightRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(InsightRow {
            id: row.try_get("id")?,
            snapshot_id: row.try_get("snapshot_id")?,
            user_id: row.try_get("user_id")?,
            category: row.try_get("category")?,
            tone: row.try_get("tone")?,
            prompt_version: row.try_get("prompt_version")?,
            model: row.try_get("model")?,
            content: row.try_get("content")?,
            structured: row.try_get("structured")?,
            generation_ms: row.try_get("generation_ms")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn insight_from_row(row: &PgRow) -> Result<Insight, StoreError> {
    let row = InsightRow::from_row(row).map_err(|e| map_sqlx_error("decode_insight", e))?;
    Ok(Insight {
        id: InsightId::from_uuid(row.id),
        snapshot_id: SnapshotId::from_uuid(row.snapshot_id),
        user_id: UserId::from_uuid(row.user_id),
        category: parse_field(&row.category)?,
        tone: parse_field(&row.tone)?,
        prompt_version: row.prompt_version,
        model: row.model,
        content: row.content,
        structured: row.structured,
        generation_ms: row.generation_ms.max(0) as u64,
        created_at: row.created_at,
    })
}

fn insight_key_from_row(row: &PgRow) -> Result<InsightKey, StoreError> {
    let map = |e| map_sqlx_error("decode_insight_key", e);
    let snapshot_id: Uuid = row.try_get("snapshot_id").map_err(map)?;
    let category: String = row.try_get("category").map_err(map)?;
    let tone: String = row.try_get("tone").map_err(map)?;
    Ok(InsightKey {
        snapshot_id: SnapshotId::from_uuid(snapshot_id),
        category: parse_field(&category)?,
        tone: parse_field(&tone)?,
        prompt_version: row.try_get("prompt_version").map_err(map)?,
    })
}
