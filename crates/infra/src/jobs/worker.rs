//! Worker pools: one set of tokio tasks per job category.
//!
//! Each worker pulls one delivery at a time, claims the job (pending -> running),
//! runs the category handler under a timeout and records the outcome:
//!
//! | Outcome | Store | Queue |
//! |---------|-------|-------|
//! | success | result + `succeeded` in one write | ack |
//! | transient error, attempts left | back to `pending` | delayed re-push, ack |
//! | other error / attempts exhausted | `failed` with detail | ack |
//! | storage error | untouched (job stays `running`) | no ack |
//! | job not pending | untouched | ack (duplicate delivery) |

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handlers::{JobError, JobHandler, JobOutput};
use super::queue::{Delivery, JobQueue, QueueError};
use super::types::{Job, JobCategory, ResultRef, RetryPolicy};
use crate::cache::ResultCache;
use crate::store::{ResultStore, StoreError};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub category: JobCategory,
    pub workers: usize,
    /// Backoff between attempts; the attempt bound comes from each job.
    pub retry: RetryPolicy,
    /// Upper bound for a single handler run.
    pub call_timeout: Duration,
    /// How long one pull waits for a message before re-checking shutdown.
    pub poll_wait: Duration,
}

impl WorkerPoolConfig {
    pub fn new(category: JobCategory) -> Self {
        Self {
            category,
            workers: 1,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(300),
            poll_wait: Duration::from_secs(1),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_poll_wait(mut self, wait: Duration) -> Self {
        self.poll_wait = wait;
        self
    }
}

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying,
    Failed,
    /// Job was not pending (duplicate or stale delivery); message dropped.
    Skipped,
    /// Storage trouble; message left unacked for redelivery or the sweep.
    Abandoned,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    pub abandoned: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Retrying => self.retried += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }
}

pub struct WorkerPool {
    store: Arc<dyn ResultStore>,
    queue: Arc<dyn JobQueue>,
    cache: ResultCache,
    handler: Arc<dyn JobHandler>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn ResultStore>,
        queue: Arc<dyn JobQueue>,
        cache: ResultCache,
        handler: Arc<dyn JobHandler>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            queue,
            cache,
            handler,
            config,
        }
    }

    pub fn category(&self) -> JobCategory {
        self.config.category
    }

    /// Start `config.workers` tasks on the current runtime.
    pub fn spawn(self) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let category = self.config.category;
        let instance = uuid::Uuid::now_v7().simple().to_string();
        let pool = Arc::new(self);

        let tasks = (0..pool.config.workers)
            .map(|i| {
                let consumer = format!("{category}-{instance}-{i}");
                tokio::spawn(worker_loop(
                    pool.clone(),
                    consumer,
                    shutdown_rx.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        info!(category = %category, workers = pool.config.workers, "worker pool started");
        WorkerPoolHandle {
            category,
            shutdown: shutdown_tx,
            tasks,
            stats,
        }
    }

    /// Pull and settle at most one delivery.
    pub async fn process_next(&self, consumer: &str) -> Result<Option<Outcome>, QueueError> {
        let category = self.config.category;
        let Some(delivery) = self.queue.pull(category, consumer, self.config.poll_wait).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(consumer, delivery).await))
    }

    async fn process(&self, consumer: &str, delivery: Delivery) -> Outcome {
        let job_id = delivery.message.job_id;

        let job = match self.store.claim_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(consumer, job_id = %job_id, "job not pending; dropping delivery");
                self.ack(&delivery).await;
                return Outcome::Skipped;
            }
            Err(e) => {
                warn!(consumer, job_id = %job_id, error = %e, "claim failed; leaving message unacked");
                return Outcome::Abandoned;
            }
        };

        debug!(
            consumer,
            job_id = %job.id,
            attempt = job.attempts,
            delivery_count = delivery.delivery_count,
            "job claimed"
        );

        let result = match tokio::time::timeout(self.config.call_timeout, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout(self.config.call_timeout)),
        };

        match result {
            Ok(output) => self.commit(&job, &delivery, output).await,
            Err(err) => self.settle_failure(&job, &delivery, err).await,
        }
    }

    async fn commit(&self, job: &Job, delivery: &Delivery, output: JobOutput) -> Outcome {
        let committed = match output {
            JobOutput::Snapshot(snapshot) => self
                .store
                .complete_with_snapshot(job.id, snapshot)
                .await
                .map(|s| CommitResult::Snapshot(Box::new(s))),
            JobOutput::Insight(insight) => self
                .store
                .complete_with_insight(job.id, insight)
                .await
                .map(|i| CommitResult::Insight(Box::new(i))),
            JobOutput::Existing(result) => self
                .store
                .complete_job(job.id, Some(result))
                .await
                .map(|_| CommitResult::Other(Some(result))),
            JobOutput::Done => self
                .store
                .complete_job(job.id, None)
                .await
                .map(|_| CommitResult::Other(None)),
        };

        match committed {
            Ok(result) => {
                let result_ref = match &result {
                    CommitResult::Snapshot(s) => {
                        self.cache.put_snapshot(s).await;
                        Some(ResultRef::Snapshot(s.id))
                    }
                    CommitResult::Insight(i) => {
                        self.cache.put_insight(i).await;
                        Some(ResultRef::Insight(i.id))
                    }
                    CommitResult::Other(r) => *r,
                };
                self.ack(delivery).await;
                info!(
                    job_id = %job.id,
                    category = %job.category,
                    attempt = job.attempts,
                    result = ?result_ref,
                    "job succeeded"
                );
                Outcome::Succeeded
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                // The sweep already moved it on; our result is discarded.
                warn!(job_id = %job.id, status = %from, "job changed state during execution");
                self.ack(delivery).await;
                Outcome::Skipped
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "result commit failed; job left for reconciliation");
                Outcome::Abandoned
            }
        }
    }

    async fn settle_failure(&self, job: &Job, delivery: &Delivery, err: JobError) -> Outcome {
        let detail = err.detail();

        if matches!(err, JobError::Storage(_)) {
            warn!(job_id = %job.id, error = %err, "storage error during job; leaving message unacked");
            return Outcome::Abandoned;
        }

        let transient = matches!(err, JobError::Transient(_) | JobError::Timeout(_));
        if transient && job.attempts < job.max_attempts {
            let delay = self.config.retry.delay_for_attempt(job.attempts);
            match self.store.schedule_retry(job.id, detail).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "could not schedule retry");
                    return Outcome::Abandoned;
                }
            }
            if let Err(e) = self
                .queue
                .push_delayed(delivery.message.clone(), delay)
                .await
            {
                // Unacked, so the original delivery comes back after the visibility timeout.
                warn!(job_id = %job.id, error = %e, "could not requeue retry");
                return Outcome::Retrying;
            }
            self.ack(delivery).await;
            info!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "job will be retried"
            );
            return Outcome::Retrying;
        }

        match self.store.fail_job(job.id, detail).await {
            Ok(failed) => {
                self.cache.put_job(&failed).await;
                self.ack(delivery).await;
                warn!(
                    job_id = %job.id,
                    category = %job.category,
                    attempt = job.attempts,
                    error = %err,
                    "job failed"
                );
                Outcome::Failed
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not record failure");
                Outcome::Abandoned
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(job_id = %delivery.message.job_id, error = %e, "ack failed; message may be redelivered");
        }
    }
}

enum CommitResult {
    Snapshot(Box<crate::store::Snapshot>),
    Insight(Box<crate::store::Insight>),
    Other(Option<ResultRef>),
}

async fn worker_loop(
    pool: Arc<WorkerPool>,
    consumer: String,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    debug!(consumer = %consumer, "worker started");
    while !*shutdown.borrow() {
        match pool.process_next(&consumer).await {
            Ok(Some(outcome)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(outcome);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(consumer = %consumer, error = %e, "failed to pull from queue");
                tokio::select! {
                    _ = tokio::time::sleep(pool.config.poll_wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
    debug!(consumer = %consumer, "worker stopped");
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    category: JobCategory,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerPoolHandle {
    pub fn category(&self) -> JobCategory {
        self.category
    }

    /// Stop pulling new work and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(category = %self.category, error = %e, "worker task panicked");
            }
        }
        info!(category = %self.category, "worker pool stopped");
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}
