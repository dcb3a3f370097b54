//! Scheduled maintenance: reconciliation sweep, retention cleanup, daily ingestion
//! and weekly summaries.
//!
//! The scheduler only submits `Maintenance` jobs on timers; the work itself runs
//! on the maintenance worker pool like any other job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use moodscope_core::{InsightCategory, TimeRange, Tone};

use super::handlers::{JobError, JobHandler, JobOutput};
use super::queue::{JobQueue, QueueMessage};
use super::submitter::JobSubmitter;
use super::types::{ErrorDetail, ErrorKind, Job, JobPayload, JobStatus, MaintenanceTask};
use crate::cache::ResultCache;
use crate::store::{ResultStore, StoreError};

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    /// Jobs not updated for this long are considered abandoned.
    pub staleness_threshold: Duration,
    pub job_retention_days: u32,
    pub snapshot_retention_days: u32,
    /// Upper bound on jobs examined per status per sweep.
    pub sweep_batch: usize,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(600),
            job_retention_days: 30,
            snapshot_retention_days: 365,
            sweep_batch: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stale running jobs sent back to pending and re-enqueued.
    pub requeued: u64,
    /// Stale running jobs out of attempts.
    pub failed: u64,
    /// Stale pending jobs with no message left on the queue, pushed again.
    pub repushed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub snapshots: u64,
    pub insights: u64,
}

#[derive(Clone)]
pub struct MaintenanceTasks {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    submitter: JobSubmitter,
    settings: MaintenanceSettings,
}

impl MaintenanceTasks {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        submitter: JobSubmitter,
        settings: MaintenanceSettings,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            submitter,
            settings,
        }
    }

    /// Recover jobs whose worker or message went missing.
    pub async fn reconcile_stale(&self) -> Result<ReconcileReport, JobError> {
        let staleness = chrono::Duration::from_std(self.settings.staleness_threshold)
            .map_err(|e| JobError::Validation(format!("staleness threshold: {e}")))?;
        let cutoff = Utc::now() - staleness;
        let mut report = ReconcileReport::default();

        let running = self
            .store
            .stale_jobs(JobStatus::Running, cutoff, self.settings.sweep_batch)
            .await?;
        for job in running {
            if job.attempts < job.max_attempts {
                let detail = ErrorDetail::new(ErrorKind::WorkerLost, "worker lost; job requeued");
                match self.store.schedule_retry(job.id, detail).await {
                    Ok(_) => {
                        self.repush(&job).await?;
                        report.requeued += 1;
                    }
                    Err(StoreError::InvalidTransition { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            } else {
                let detail = ErrorDetail::new(
                    ErrorKind::WorkerLost,
                    format!("worker lost after {} attempts", job.attempts),
                );
                match self.store.fail_job(job.id, detail).await {
                    Ok(failed) => {
                        self.cache.put_job(&failed).await;
                        report.failed += 1;
                    }
                    Err(StoreError::InvalidTransition { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let pending = self
            .store
            .stale_jobs(JobStatus::Pending, cutoff, self.settings.sweep_batch)
            .await?;
        for job in pending {
            let queued = self
                .queue
                .is_queued(job.category, job.id)
                .await
                .map_err(|e| JobError::Transient(e.to_string()))?;
            if queued {
                debug!(job_id = %job.id, "stale pending job still queued");
            } else {
                self.repush(&job).await?;
                report.repushed += 1;
            }
            // Restart the staleness clock so the next sweep moves on.
            self.store.touch_job(job.id).await?;
        }

        if report != ReconcileReport::default() {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                repushed = report.repushed,
                "reconciled stale jobs"
            );
        }
        Ok(report)
    }

    async fn repush(&self, job: &Job) -> Result<(), JobError> {
        self.queue
            .push(QueueMessage::new(job.id, job.payload.clone()))
            .await
            .map_err(|e| JobError::Transient(e.to_string()))
    }

    /// Delete terminal job records past retention and their cached status.
    pub async fn cleanup_jobs(&self) -> Result<u64, JobError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.settings.job_retention_days));
        let purged = self.store.purge_jobs(cutoff).await?;
        for id in &purged {
            self.cache.invalidate_job(*id).await;
        }
        let removed = purged.len() as u64;
        info!(removed, "cleaned up old jobs");
        Ok(removed)
    }

    /// Delete snapshots past retention, their insights, and the matching cache entries.
    pub async fn cleanup_snapshots(&self) -> Result<CleanupReport, JobError> {
        let before = Utc::now().date_naive()
            - chrono::Duration::days(i64::from(self.settings.snapshot_retention_days));
        let purged = self.store.purge_snapshots(before).await?;

        for (id, key) in &purged.insights {
            self.cache.invalidate_insight(*id, key).await;
        }
        for (id, key) in &purged.snapshots {
            self.cache.invalidate_snapshot(*id, key).await;
        }

        let report = CleanupReport {
            snapshots: purged.snapshots.len() as u64,
            insights: purged.insights.len() as u64,
        };
        info!(snapshots = report.snapshots, insights = report.insights, "cleaned up old snapshots");
        Ok(report)
    }

    /// Queue a supportive wellness insight for every user active in the last week.
    ///
    /// Returns how many generations were submitted.
    pub async fn weekly_summaries(&self) -> Result<u64, JobError> {
        let since = Utc::now().date_naive() - chrono::Duration::days(7);
        let snapshots = self.store.latest_snapshots_since(since).await?;

        let mut submitted = 0;
        let mut first_error = None;
        for snapshot in snapshots {
            match self
                .submitter
                .submit_generation(snapshot.id, InsightCategory::Wellness, Some(Tone::Supportive))
                .await
            {
                Ok(job_id) => {
                    debug!(job_id = %job_id, user_id = %snapshot.user_id, "weekly summary submitted");
                    submitted += 1;
                }
                Err(e) => {
                    warn!(user_id = %snapshot.user_id, error = %e, "weekly summary submission failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(submitted, "weekly summaries submitted");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(submitted),
        }
    }

    /// Queue a medium-term ingestion for every user with a snapshot inside retention.
    ///
    /// Returns how many ingestions were submitted.
    pub async fn daily_ingest(&self) -> Result<u64, JobError> {
        let since = Utc::now().date_naive()
            - chrono::Duration::days(i64::from(self.settings.snapshot_retention_days));
        let users = self.store.latest_snapshots_since(since).await?;

        let mut submitted = 0;
        let mut first_error = None;
        for snapshot in users {
            match self
                .submitter
                .submit_ingestion(snapshot.user_id, TimeRange::MediumTerm)
                .await
            {
                Ok(job_id) => {
                    debug!(job_id = %job_id, user_id = %snapshot.user_id, "daily ingestion submitted");
                    submitted += 1;
                }
                Err(e) => {
                    warn!(user_id = %snapshot.user_id, error = %e, "daily ingestion submission failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(submitted, "daily ingestions submitted");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(submitted),
        }
    }
}

/// Runs maintenance jobs on the maintenance pool.
#[derive(Clone)]
pub struct MaintenanceHandler {
    tasks: MaintenanceTasks,
}

impl MaintenanceHandler {
    pub fn new(tasks: MaintenanceTasks) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl JobHandler for MaintenanceHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutput, JobError> {
        let JobPayload::Maintenance { task } = &job.payload else {
            return Err(JobError::Validation(format!(
                "maintenance worker got {} job",
                job.payload.category()
            )));
        };

        match task {
            MaintenanceTask::ReconcileStale => {
                self.tasks.reconcile_stale().await?;
            }
            MaintenanceTask::CleanupJobs => {
                self.tasks.cleanup_jobs().await?;
            }
            MaintenanceTask::CleanupSnapshots => {
                self.tasks.cleanup_snapshots().await?;
            }
            MaintenanceTask::WeeklySummaries => {
                self.tasks.weekly_summaries().await?;
            }
            MaintenanceTask::DailyIngest => {
                self.tasks.daily_ingest().await?;
            }
        }
        Ok(JobOutput::Done)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub sweep_interval: Duration,
    pub cleanup_interval: Duration,
    pub ingest_interval: Duration,
    pub summary_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(24 * 3600),
            ingest_interval: Duration::from_secs(24 * 3600),
            summary_interval: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

const SWEEP_TASKS: &[MaintenanceTask] = &[MaintenanceTask::ReconcileStale];
const CLEANUP_TASKS: &[MaintenanceTask] = &[MaintenanceTask::CleanupJobs, MaintenanceTask::CleanupSnapshots];
const INGEST_TASKS: &[MaintenanceTask] = &[MaintenanceTask::DailyIngest];
const SUMMARY_TASKS: &[MaintenanceTask] = &[MaintenanceTask::WeeklySummaries];

/// Timer that submits maintenance jobs.
pub struct MaintenanceScheduler {
    submitter: JobSubmitter,
    config: ScheduleConfig,
}

impl MaintenanceScheduler {
    pub fn new(submitter: JobSubmitter, config: ScheduleConfig) -> Self {
        Self { submitter, config }
    }

    pub fn spawn(self) -> MaintenanceSchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let every = |period: Duration| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            };
            let mut sweep = every(self.config.sweep_interval);
            let mut cleanup = every(self.config.cleanup_interval);
            let mut ingest = every(self.config.ingest_interval);
            let mut summaries = every(self.config.summary_interval);

            info!("maintenance scheduler started");
            loop {
                let tasks = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sweep.tick() => SWEEP_TASKS,
                    _ = cleanup.tick() => CLEANUP_TASKS,
                    _ = ingest.tick() => INGEST_TASKS,
                    _ = summaries.tick() => SUMMARY_TASKS,
                };
                for task in tasks {
                    if let Err(e) = self.submitter.submit_maintenance(*task).await {
                        warn!(task = task.as_str(), error = %e, "could not submit maintenance job");
                    }
                }
            }
            info!("maintenance scheduler stopped");
        });

        MaintenanceSchedulerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[derive(Debug)]
pub struct MaintenanceSchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceSchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "maintenance scheduler task panicked");
        }
    }
}
