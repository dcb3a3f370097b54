//! In-memory result store for tests/dev.
//!
//! All maps sit behind one lock so a result write and its job transition are
//! observed together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use moodscope_core::{InsightCategory, InsightId, SnapshotId, TimeRange, UserId};

use super::{
    Insight, InsightKey, JobStats, NewInsight, NewSnapshot, PurgedSnapshots, ResultStore,
    Snapshot, SnapshotKey, StoreError,
};
use crate::jobs::types::{ErrorDetail, Job, JobId, JobStatus, ResultRef};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    snapshots: HashMap<SnapshotId, Snapshot>,
    snapshot_keys: HashMap<SnapshotKey, SnapshotId>,
    insights: HashMap<InsightId, Insight>,
    insight_keys: HashMap<InsightKey, InsightId>,
}

impl State {
    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    /// Check that `job_id` may move to `to` from one of `from`.
    fn check(&self, job_id: JobId, from: &[JobStatus], to: JobStatus) -> Result<(), StoreError> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        if from.contains(&job.status) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to,
            })
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    state: RwLock<State>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {}", job.id)));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn claim_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut state = self.write()?;
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.mark_running();
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn schedule_retry(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        state.check(job_id, &[JobStatus::Running], JobStatus::Pending)?;
        let job = state.job_mut(job_id)?;
        job.mark_retry(error);
        Ok(job.clone())
    }

    async fn fail_job(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        state.check(
            job_id,
            &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Failed,
        )?;
        let job = state.job_mut(job_id)?;
        job.mark_failed(error);
        Ok(job.clone())
    }

    async fn complete_job(&self, job_id: JobId, result: Option<ResultRef>) -> Result<Job, StoreError> {
        let mut state = self.write()?;
        state.check(job_id, &[JobStatus::Running], JobStatus::Succeeded)?;
        let job = state.job_mut(job_id)?;
        job.mark_succeeded(result);
        Ok(job.clone())
    }

    async fn complete_with_snapshot(
        &self,
        job_id: JobId,
        snapshot: NewSnapshot,
    ) -> Result<Snapshot, StoreError> {
        let mut state = self.write()?;
        state.check(job_id, &[JobStatus::Running], JobStatus::Succeeded)?;

        let key = snapshot.key();
        let now = Utc::now();
        let source_record_count = snapshot.metrics.source_record_count;
        let stored = match state.snapshot_keys.get(&key).copied() {
            Some(existing) => {
                let row = state
                    .snapshots
                    .get_mut(&existing)
                    .ok_or_else(|| StoreError::Corrupt(format!("dangling snapshot key {existing}")))?;
                row.metrics = snapshot.metrics;
                row.source_record_count = source_record_count;
                row.updated_at = now;
                row.clone()
            }
            None => {
                let row = Snapshot {
                    id: SnapshotId::new(),
                    user_id: snapshot.user_id,
                    captured_on: snapshot.captured_on,
                    time_range: snapshot.time_range,
                    metrics: snapshot.metrics,
                    source_record_count,
                    created_at: now,
                    updated_at: now,
                };
                state.snapshot_keys.insert(key, row.id);
                state.snapshots.insert(row.id, row.clone());
                row
            }
        };

        state
            .job_mut(job_id)?
            .mark_succeeded(Some(ResultRef::Snapshot(stored.id)));
        Ok(stored)
    }

    async fn complete_with_insight(
        &self,
        job_id: JobId,
        insight: NewInsight,
    ) -> Result<Insight, StoreError> {
        let mut state = self.write()?;
        state.check(job_id, &[JobStatus::Running], JobStatus::Succeeded)?;
        if !state.snapshots.contains_key(&insight.snapshot_id) {
            return Err(StoreError::NotFound(format!("snapshot {}", insight.snapshot_id)));
        }

        let key = insight.key();
        let stored = match state.insight_keys.get(&key).copied() {
            Some(existing) => state
                .insights
                .get(&existing)
                .cloned()
                .ok_or_else(|| StoreError::Corrupt(format!("dangling insight key {existing}")))?,
            None => {
                let row = Insight {
                    id: InsightId::new(),
                    snapshot_id: insight.snapshot_id,
                    user_id: insight.user_id,
                    category: insight.category,
                    tone: insight.tone,
                    prompt_version: insight.prompt_version,
                    model: insight.model,
                    content: insight.content,
                    structured: insight.structured,
                    generation_ms: insight.generation_ms,
                    created_at: Utc::now(),
                };
                state.insight_keys.insert(key, row.id);
                state.insights.insert(row.id, row.clone());
                row
            }
        };

        state
            .job_mut(job_id)?
            .mark_succeeded(Some(ResultRef::Insight(stored.id)));
        Ok(stored)
    }

    async fn touch_job(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let job = state.job_mut(job_id)?;
        if !job.status.is_terminal() {
            job.touch();
        }
        Ok(())
    }

    async fn stale_jobs(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == status && j.updated_at < before)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn purge_jobs(&self, before: DateTime<Utc>) -> Result<Vec<JobId>, StoreError> {
        let mut state = self.write()?;
        let mut purged = Vec::new();
        state.jobs.retain(|id, j| {
            let expired = j.status.is_terminal() && j.finished_at.unwrap_or(j.updated_at) < before;
            if expired {
                purged.push(*id);
            }
            !expired
        });
        Ok(purged)
    }

    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let state = self.read()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Succeeded => stats.succeeded += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn get_snapshot(&self, id: SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.read()?.snapshots.get(&id).cloned())
    }

    async fn find_snapshot(&self, key: &SnapshotKey) -> Result<Option<Snapshot>, StoreError> {
        let state = self.read()?;
        Ok(state
            .snapshot_keys
            .get(key)
            .and_then(|id| state.snapshots.get(id))
            .cloned())
    }

    async fn list_snapshots(
        &self,
        user_id: UserId,
        time_range: Option<TimeRange>,
        limit: usize,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<Snapshot> = state
            .snapshots
            .values()
            .filter(|s| s.user_id == user_id && time_range.is_none_or(|r| s.time_range == r))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.captured_on
                .cmp(&a.captured_on)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn latest_snapshots_since(&self, since: NaiveDate) -> Result<Vec<Snapshot>, StoreError> {
        let state = self.read()?;
        let mut latest: HashMap<UserId, &Snapshot> = HashMap::new();
        for s in state.snapshots.values().filter(|s| s.captured_on >= since) {
            match latest.get(&s.user_id) {
                Some(cur) if (cur.captured_on, cur.updated_at) >= (s.captured_on, s.updated_at) => {}
                _ => {
                    latest.insert(s.user_id, s);
                }
            }
        }
        let mut result: Vec<Snapshot> = latest.into_values().cloned().collect();
        result.sort_by_key(|s| s.user_id);
        Ok(result)
    }

    async fn purge_snapshots(&self, before: NaiveDate) -> Result<PurgedSnapshots, StoreError> {
        let mut state = self.write()?;
        let doomed: Vec<(SnapshotId, SnapshotKey)> = state
            .snapshots
            .values()
            .filter(|s| s.captured_on < before)
            .map(|s| (s.id, s.key()))
            .collect();

        let mut purged = PurgedSnapshots::default();
        for (id, key) in doomed {
            state.snapshots.remove(&id);
            state.snapshot_keys.remove(&key);

            let insights: Vec<(InsightId, InsightKey)> = state
                .insights
                .values()
                .filter(|i| i.snapshot_id == id)
                .map(|i| (i.id, i.key()))
                .collect();
            for (insight_id, insight_key) in insights {
                state.insights.remove(&insight_id);
                state.insight_keys.remove(&insight_key);
                purged.insights.push((insight_id, insight_key));
            }
            purged.snapshots.push((id, key));
        }
        Ok(purged)
    }

    async fn get_insight(&self, id: InsightId) -> Result<Option<Insight>, StoreError> {
        Ok(self.read()?.insights.get(&id).cloned())
    }

    async fn find_insight(&self, key: &InsightKey) -> Result<Option<Insight>, StoreError> {
        let state = self.read()?;
        Ok(state
            .insight_keys
            .get(key)
            .and_then(|id| state.insights.get(id))
            .cloned())
    }

    async fn list_insights(
        &self,
        user_id: UserId,
        category: Option<InsightCategory>,
        limit: usize,
    ) -> Result<Vec<Insight>, StoreError> {
        let state = self.read()?;
        let mut result: Vec<Insight> = state
            .insights
            .values()
            .filter(|i| i.user_id == user_id && category.is_none_or(|c| i.category == c))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        result.truncate(limit);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{ErrorKind, JobPayload};
    use moodscope_core::Tone;
    use moodscope_insights::AggregateMetrics;

    fn ingest_job() -> Job {
        Job::new(
            JobPayload::Ingest {
                user_id: UserId::new(),
                time_range: TimeRange::MediumTerm,
            },
            3,
        )
    }

    fn new_snapshot(user_id: UserId, day: u32, records: u32) -> NewSnapshot {
        NewSnapshot {
            user_id,
            captured_on: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            time_range: TimeRange::MediumTerm,
            metrics: AggregateMetrics {
                source_record_count: records,
                ..Default::default()
            },
        }
    }

    fn new_insight(snapshot: &Snapshot, content: &str) -> NewInsight {
        NewInsight {
            snapshot_id: snapshot.id,
            user_id: snapshot.user_id,
            category: InsightCategory::Wellness,
            tone: Tone::Supportive,
            prompt_version: "v1.0".into(),
            model: "m".into(),
            content: content.into(),
            structured: serde_json::json!({}),
            generation_ms: 5,
        }
    }

    async fn running(store: &InMemoryResultStore) -> Job {
        let job = ingest_job();
        store.insert_job(&job).await.unwrap();
        store.claim_job(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn claim_only_from_pending() {
        let store = InMemoryResultStore::new();
        let job = ingest_job();
        store.insert_job(&job).await.unwrap();

        let claimed = store.claim_job(job.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);

        assert!(store.claim_job(job.id).await.unwrap().is_none());
        assert!(store.claim_job(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let store = InMemoryResultStore::new();
        let job = running(&store).await;
        store.complete_job(job.id, None).await.unwrap();

        let err = store
            .fail_job(job.id, ErrorDetail::new(ErrorKind::WorkerLost, "late"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: JobStatus::Succeeded, to: JobStatus::Failed, .. }
        ));
        assert!(store.claim_job(job.id).await.unwrap().is_none());
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn same_day_reingestion_overwrites_and_keeps_id() {
        let store = InMemoryResultStore::new();
        let user = UserId::new();

        let first_job = running(&store).await;
        let first = store
            .complete_with_snapshot(first_job.id, new_snapshot(user, 10, 20))
            .await
            .unwrap();

        let second_job = running(&store).await;
        let second = store
            .complete_with_snapshot(second_job.id, new_snapshot(user, 10, 35))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.source_record_count, 35);
        assert_eq!(store.list_snapshots(user, None, 10).await.unwrap().len(), 1);

        let job = store.get_job(second_job.id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(ResultRef::Snapshot(first.id)));
    }

    #[tokio::test]
    async fn snapshot_write_is_rejected_for_a_job_that_is_not_running() {
        let store = InMemoryResultStore::new();
        let job = ingest_job();
        store.insert_job(&job).await.unwrap();

        let err = store
            .complete_with_snapshot(job.id, new_snapshot(UserId::new(), 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.job_stats().await.unwrap().pending, 1);
        assert!(store.read().unwrap().snapshots.is_empty());
    }

    #[tokio::test]
    async fn duplicate_insight_returns_existing_row() {
        let store = InMemoryResultStore::new();
        let job = running(&store).await;
        let snapshot = store
            .complete_with_snapshot(job.id, new_snapshot(UserId::new(), 2, 5))
            .await
            .unwrap();

        let a = running(&store).await;
        let first = store
            .complete_with_insight(a.id, new_insight(&snapshot, "first"))
            .await
            .unwrap();
        let b = running(&store).await;
        let second = store
            .complete_with_insight(b.id, new_insight(&snapshot, "second"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "first");
        assert_eq!(
            store.get_job(b.id).await.unwrap().unwrap().result,
            Some(ResultRef::Insight(first.id))
        );
        assert_eq!(store.find_insight(&first.key()).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn list_snapshots_is_most_recent_first_and_filters_range() {
        let store = InMemoryResultStore::new();
        let user = UserId::new();
        for day in [3, 9, 5] {
            let job = running(&store).await;
            store
                .complete_with_snapshot(job.id, new_snapshot(user, day, day))
                .await
                .unwrap();
        }
        let job = running(&store).await;
        let mut short = new_snapshot(user, 20, 1);
        short.time_range = TimeRange::ShortTerm;
        store.complete_with_snapshot(job.id, short).await.unwrap();

        let medium = store
            .list_snapshots(user, Some(TimeRange::MediumTerm), 2)
            .await
            .unwrap();
        let days: Vec<u32> = medium.iter().map(|s| s.source_record_count).collect();
        assert_eq!(days, vec![9, 5]);

        let all = store.list_snapshots(user, None, 10).await.unwrap();
        assert_eq!(all[0].time_range, TimeRange::ShortTerm);
        assert!(store.list_snapshots(UserId::new(), None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_insights_is_newest_first_and_filters_category() {
        let store = InMemoryResultStore::new();
        let user = UserId::new();
        let job = running(&store).await;
        let snapshot = store
            .complete_with_snapshot(job.id, new_snapshot(user, 4, 1))
            .await
            .unwrap();

        let mut created = Vec::new();
        for (category, tone) in [
            (InsightCategory::Wellness, Tone::Supportive),
            (InsightCategory::Roast, Tone::Roast),
            (InsightCategory::Wellness, Tone::Neutral),
        ] {
            let job = running(&store).await;
            let insight = store
                .complete_with_insight(
                    job.id,
                    NewInsight {
                        category,
                        tone,
                        ..new_insight(&snapshot, "c")
                    },
                )
                .await
                .unwrap();
            created.push(insight.id);
        }

        let all = store.list_insights(user, None, 10).await.unwrap();
        let ids: Vec<InsightId> = all.iter().map(|i| i.id).collect();
        assert_eq!(ids, created.iter().rev().copied().collect::<Vec<_>>());

        let wellness = store
            .list_insights(user, Some(InsightCategory::Wellness), 1)
            .await
            .unwrap();
        assert_eq!(wellness.len(), 1);
        assert_eq!(wellness[0].id, created[2]);

        assert!(store.list_insights(UserId::new(), None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_snapshots_cascades_to_insights() {
        let store = InMemoryResultStore::new();
        let user = UserId::new();
        let old_job = running(&store).await;
        let old = store
            .complete_with_snapshot(old_job.id, new_snapshot(user, 1, 1))
            .await
            .unwrap();
        let gen_job = running(&store).await;
        let insight = store
            .complete_with_insight(gen_job.id, new_insight(&old, "bye"))
            .await
            .unwrap();
        let new_job = running(&store).await;
        let kept = store
            .complete_with_snapshot(new_job.id, new_snapshot(user, 20, 1))
            .await
            .unwrap();

        let purged = store
            .purge_snapshots(NaiveDate::from_ymd_opt(2026, 3, 15).unwrap())
            .await
            .unwrap();

        assert_eq!(purged.snapshots, vec![(old.id, old.key())]);
        assert_eq!(purged.insights, vec![(insight.id, insight.key())]);
        assert!(store.get_insight(insight.id).await.unwrap().is_none());
        assert!(store.get_snapshot(kept.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_jobs_only_removes_old_terminal_jobs() {
        let store = InMemoryResultStore::new();
        let done = running(&store).await;
        store.complete_job(done.id, None).await.unwrap();
        let pending = ingest_job();
        store.insert_job(&pending).await.unwrap();

        let removed = store
            .purge_jobs(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, vec![done.id]);
        assert!(store.get_job(done.id).await.unwrap().is_none());
        assert!(store.get_job(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn latest_snapshot_per_user() {
        let store = InMemoryResultStore::new();
        let (u1, u2) = (UserId::new(), UserId::new());
        for (user, day) in [(u1, 10), (u1, 12), (u2, 11), (u2, 2)] {
            let job = running(&store).await;
            store
                .complete_with_snapshot(job.id, new_snapshot(user, day, day))
                .await
                .unwrap();
        }

        let latest = store
            .latest_snapshots_since(NaiveDate::from_ymd_opt(2026, 3, 5).unwrap())
            .await
            .unwrap();
        assert_eq!(latest.len(), 2);
        let counts: HashMap<UserId, u32> = latest
            .iter()
            .map(|s| (s.user_id, s.source_record_count))
            .collect();
        assert_eq!(counts[&u1], 12);
        assert_eq!(counts[&u2], 11);
    }
}
