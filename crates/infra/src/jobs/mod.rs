//! Asynchronous job orchestration.
//!
//! ## Flow
//!
//! `JobSubmitter` → `JobQueue` → `WorkerPool` → `ResultStore` (+ `ResultCache`) ← `StatusPoller`
//!
//! Submitter and workers never talk directly; all coordination goes through
//! the queue and the result store.
//!
//! ## Components
//!
//! - `Job`: lifecycle record (pending → running → succeeded | failed)
//! - `JobQueue`: per-category at-least-once channel (in-memory or Redis Streams)
//! - `WorkerPool`: tokio tasks running a category handler with timeout and retry
//! - `StatusPoller`: read-only status queries
//! - `MaintenanceScheduler`: timers that submit sweep/cleanup/summary jobs

pub mod handlers;
pub mod maintenance;
pub mod poller;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis_queue;
pub mod submitter;
pub mod types;
pub mod worker;

pub use handlers::{GenerationHandler, IngestionHandler, JobError, JobHandler, JobOutput};
pub use maintenance::{
    CleanupReport, MaintenanceHandler, MaintenanceScheduler, MaintenanceSchedulerHandle,
    MaintenanceSettings, MaintenanceTasks, ReconcileReport, ScheduleConfig,
};
pub use poller::{JobState, JobStatusView, StatusPoller};
pub use queue::{Delivery, InMemoryJobQueue, JobQueue, QueueDepth, QueueError, QueueMessage};
#[cfg(feature = "redis")]
pub use redis_queue::RedisJobQueue;
pub use submitter::{AttemptLimits, GenerateRequest, IngestRequest, JobSubmitter, MaintenanceRequest, SubmitError};
pub use types::{
    BackoffStrategy, ErrorDetail, ErrorKind, Job, JobCategory, JobId, JobPayload, JobStatus,
    MaintenanceTask, ResultRef, RetryPolicy,
};
pub use worker::{Outcome, WorkerPool, WorkerPoolConfig, WorkerPoolHandle, WorkerStats};
