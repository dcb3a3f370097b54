//! End-to-end tests for the job loop.
//!
//! Tests: Orchestrator → JobQueue → WorkerPool → ResultStore → StatusPoller
//!
//! Verifies:
//! - Ingestion and generation results are reachable through job status
//! - Identical generation requests never call the generator twice
//! - Transient failures end in `failed` once attempts run out
//! - Duplicate work collapses onto one snapshot or one insight

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use moodscope_core::{InsightCategory, TimeRange, Tone, UserId};
    use moodscope_insights::{
        AudioFeatures, ContentPayload, GenerationError, GenerationRequest, ListeningSource,
        RawListeningRecords, SourceError, TemplateGenerator, TextGenerator,
    };

    use crate::cache::ResultCache;
    use crate::config::OrchestratorConfig;
    use crate::jobs::{
        ErrorKind, GenerationHandler, IngestionHandler, InMemoryJobQueue, JobCategory, JobHandler,
        JobId, JobQueue, JobState, JobStatusView, MaintenanceSettings, MaintenanceTasks, Outcome,
        ResultRef, RetryPolicy, WorkerPool, WorkerPoolConfig,
    };
    use crate::orchestrator::{Orchestrator, OrchestratorError};
    use crate::store::{InMemoryResultStore, ResultStore};

    /// Two tracks averaging a valence of 0.65.
    struct FixedSource;

    #[async_trait]
    impl ListeningSource for FixedSource {
        async fn fetch_listening_data(
            &self,
            _user_id: UserId,
            _time_range: TimeRange,
        ) -> Result<RawListeningRecords, SourceError> {
            let track = |id: &str, valence: f64| AudioFeatures {
                track_id: id.to_string(),
                valence: Some(valence),
                energy: Some(0.5),
                ..Default::default()
            };
            Ok(RawListeningRecords {
                tracks: vec![track("t1", 0.6), track("t2", 0.7)],
                artists: Vec::new(),
            })
        }
    }

    struct RateLimitedSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ListeningSource for RateLimitedSource {
        async fn fetch_listening_data(
            &self,
            _user_id: UserId,
            _time_range: TimeRange,
        ) -> Result<RawListeningRecords, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::RateLimited {
                retry_after_secs: None,
            })
        }
    }

    struct CountingGenerator {
        inner: TemplateGenerator,
        calls: AtomicU32,
    }

    #[async_trait]
    impl TextGenerator for CountingGenerator {
        fn model(&self) -> &str {
            self.inner.model()
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<ContentPayload, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.generate(request).await
        }
    }

    struct System {
        orchestrator: Orchestrator,
        store: Arc<InMemoryResultStore>,
        queue: Arc<InMemoryJobQueue>,
        cache: ResultCache,
    }

    impl System {
        fn new() -> Self {
            let store = InMemoryResultStore::arc();
            let queue = InMemoryJobQueue::arc(Duration::from_secs(60));
            let cache = ResultCache::in_memory();
            let orchestrator = Orchestrator::new(
                store.clone(),
                queue.clone(),
                cache.clone(),
                OrchestratorConfig::default(),
            );
            Self {
                orchestrator,
                store,
                queue,
                cache,
            }
        }

        fn pool(&self, category: JobCategory, handler: Arc<dyn JobHandler>) -> WorkerPool {
            let config = WorkerPoolConfig::new(category)
                .with_retry(RetryPolicy::fixed(3, Duration::ZERO))
                .with_poll_wait(Duration::from_millis(10));
            WorkerPool::new(
                self.store.clone(),
                self.queue.clone(),
                self.cache.clone(),
                handler,
                config,
            )
        }

        fn ingestion_pool(&self, source: Arc<dyn ListeningSource>) -> WorkerPool {
            self.pool(JobCategory::Ingestion, Arc::new(IngestionHandler::new(source)))
        }

        fn generation_pool(&self, generator: Arc<dyn TextGenerator>) -> WorkerPool {
            self.pool(
                JobCategory::Generation,
                Arc::new(GenerationHandler::new(self.store.clone(), generator)),
            )
        }

        async fn status(&self, job_id: JobId) -> JobStatusView {
            self.orchestrator.get_job_status(job_id).await.unwrap()
        }
    }

    /// Run one worker until the queue stays empty.
    async fn drain(pool: &WorkerPool) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = pool.process_next("test-worker").await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn ingestion_produces_listable_snapshot() {
        let sys = System::new();
        let user = UserId::new();
        let job_id = sys
            .orchestrator
            .submit_ingestion(user, TimeRange::MediumTerm)
            .await
            .unwrap();
        assert_eq!(sys.status(job_id).await.state, JobState::Pending);

        let outcomes = drain(&sys.ingestion_pool(Arc::new(FixedSource))).await;
        assert_eq!(outcomes, vec![Outcome::Succeeded]);

        let status = sys.status(job_id).await;
        assert_eq!(status.state, JobState::Succeeded);
        let Some(ResultRef::Snapshot(snapshot_id)) = status.result else {
            panic!("expected snapshot result, got {:?}", status.result);
        };

        let listed = sys
            .orchestrator
            .list_snapshots(user, None, Some(1))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snapshot_id);
        assert_eq!(listed[0].time_range, TimeRange::MediumTerm);
        let valence = listed[0].metrics.avg_valence().unwrap();
        assert!((valence - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn repeated_generation_reuses_insight() {
        let sys = System::new();
        let user = UserId::new();
        sys.orchestrator
            .submit_ingestion(user, TimeRange::MediumTerm)
            .await
            .unwrap();
        drain(&sys.ingestion_pool(Arc::new(FixedSource))).await;
        let snapshot = sys
            .orchestrator
            .list_snapshots(user, Some(TimeRange::MediumTerm), None)
            .await
            .unwrap()
            .remove(0);

        let generator = Arc::new(CountingGenerator {
            inner: TemplateGenerator::new(),
            calls: AtomicU32::new(0),
        });
        let pool = sys.generation_pool(generator.clone());

        let first = sys
            .orchestrator
            .submit_generation(snapshot.id, InsightCategory::Wellness, Some(Tone::Supportive))
            .await
            .unwrap();
        assert_eq!(drain(&pool).await, vec![Outcome::Succeeded]);

        let status = sys.status(first).await;
        assert_eq!(status.state, JobState::Succeeded);
        let Some(ResultRef::Insight(insight_id)) = status.result else {
            panic!("expected insight result, got {:?}", status.result);
        };
        let insight = sys.orchestrator.get_insight(insight_id).await.unwrap();
        assert_eq!(insight.snapshot_id, snapshot.id);
        assert_eq!(insight.tone, Tone::Supportive);
        assert!(!insight.content.is_empty());

        let second = sys
            .orchestrator
            .submit_generation(snapshot.id, InsightCategory::Wellness, Some(Tone::Supportive))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert!(drain(&pool).await.is_empty());

        let status = sys.status(second).await;
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.result, Some(ResultRef::Insight(insight_id)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

        let listed = sys
            .orchestrator
            .list_insights(user, Some(InsightCategory::Wellness), None)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, insight_id);
        assert!(sys
            .orchestrator
            .list_insights(user, Some(InsightCategory::Roast), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn concurrent_duplicate_generations_share_one_insight() {
        let sys = System::new();
        let user = UserId::new();
        sys.orchestrator
            .submit_ingestion(user, TimeRange::MediumTerm)
            .await
            .unwrap();
        drain(&sys.ingestion_pool(Arc::new(FixedSource))).await;
        let snapshot = sys
            .orchestrator
            .list_snapshots(user, None, None)
            .await
            .unwrap()
            .remove(0);

        // Both are queued before either runs, so neither short-circuits at submission.
        let a = sys
            .orchestrator
            .submit_generation(snapshot.id, InsightCategory::Roast, None)
            .await
            .unwrap();
        let b = sys
            .orchestrator
            .submit_generation(snapshot.id, InsightCategory::Roast, None)
            .await
            .unwrap();
        assert_eq!(sys.status(a).await.state, JobState::Pending);
        assert_eq!(sys.status(b).await.state, JobState::Pending);

        let pool = sys.generation_pool(Arc::new(TemplateGenerator::new()));
        let (x, y) = tokio::join!(pool.process_next("worker-a"), pool.process_next("worker-b"));
        assert_eq!(x.unwrap(), Some(Outcome::Succeeded));
        assert_eq!(y.unwrap(), Some(Outcome::Succeeded));

        let ra = sys.status(a).await.result;
        let rb = sys.status(b).await.result;
        assert!(matches!(ra, Some(ResultRef::Insight(_))));
        assert_eq!(ra, rb);

        let listed = sys.orchestrator.list_insights(user, None, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(ra, Some(ResultRef::Insight(listed[0].id)));
    }

    #[tokio::test]
    async fn rate_limited_ingestion_fails_after_attempts() {
        let sys = System::new();
        let source = Arc::new(RateLimitedSource {
            calls: AtomicU32::new(0),
        });
        let job_id = sys
            .orchestrator
            .submit_ingestion(UserId::new(), TimeRange::ShortTerm)
            .await
            .unwrap();

        let outcomes = drain(&sys.ingestion_pool(source.clone())).await;
        assert_eq!(
            outcomes,
            vec![Outcome::Retrying, Outcome::Retrying, Outcome::Failed]
        );
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        let status = sys.status(job_id).await;
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.attempts, 3);
        assert_eq!(status.error.map(|e| e.kind), Some(ErrorKind::ExternalTransient));
    }

    #[tokio::test]
    async fn duplicate_ingestions_share_one_snapshot() {
        let sys = System::new();
        let user = UserId::new();
        let a = sys
            .orchestrator
            .submit_ingestion(user, TimeRange::LongTerm)
            .await
            .unwrap();
        let b = sys
            .orchestrator
            .submit_ingestion(user, TimeRange::LongTerm)
            .await
            .unwrap();

        let pool = sys.ingestion_pool(Arc::new(FixedSource));
        let (x, y) = tokio::join!(pool.process_next("worker-a"), pool.process_next("worker-b"));
        assert_eq!(x.unwrap(), Some(Outcome::Succeeded));
        assert_eq!(y.unwrap(), Some(Outcome::Succeeded));

        let ra = sys.status(a).await.result;
        let rb = sys.status(b).await.result;
        assert!(ra.is_some());
        assert_eq!(ra, rb);

        let listed = sys
            .orchestrator
            .list_snapshots(user, None, Some(10))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn generation_for_unknown_snapshot_is_rejected() {
        let sys = System::new();
        let err = sys
            .orchestrator
            .submit_generation(
                moodscope_core::SnapshotId::new(),
                InsightCategory::Roast,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        assert_eq!(sys.store.job_stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn closed_queue_reports_unavailable_and_fails_job() {
        let sys = System::new();
        sys.queue.close();
        let err = sys
            .orchestrator
            .submit_ingestion(UserId::new(), TimeRange::MediumTerm)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueUnavailable(_)));

        let stats = sys.store.job_stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn lost_worker_is_recovered_by_reconciliation() {
        let sys = System::new();
        let job_id = sys
            .orchestrator
            .submit_ingestion(UserId::new(), TimeRange::MediumTerm)
            .await
            .unwrap();

        // A worker takes the message and dies without acking or finishing.
        let lost = sys
            .queue
            .pull(JobCategory::Ingestion, "doomed", Duration::ZERO)
            .await
            .unwrap();
        assert!(lost.is_some());
        sys.store.claim_job(job_id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let tasks = MaintenanceTasks::new(
            sys.store.clone(),
            sys.queue.clone(),
            sys.cache.clone(),
            sys.orchestrator.submitter().clone(),
            MaintenanceSettings {
                staleness_threshold: Duration::ZERO,
                ..Default::default()
            },
        );
        let report = tasks.reconcile_stale().await.unwrap();
        assert_eq!(report.requeued, 1);

        let outcomes = drain(&sys.ingestion_pool(Arc::new(FixedSource))).await;
        assert_eq!(outcomes, vec![Outcome::Succeeded]);
        let status = sys.status(job_id).await;
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.attempts, 2);
    }

    #[tokio::test]
    async fn overview_counts_queues_and_jobs() {
        let sys = System::new();
        sys.orchestrator
            .submit_ingestion(UserId::new(), TimeRange::MediumTerm)
            .await
            .unwrap();

        let overview = sys.orchestrator.queue_overview().await.unwrap();
        assert_eq!(overview.queues.len(), 3);
        assert_eq!(overview.queues[&JobCategory::Ingestion].ready, 1);
        assert_eq!(overview.queues[&JobCategory::Generation].ready, 0);
        assert_eq!(overview.jobs.pending, 1);
    }
}
