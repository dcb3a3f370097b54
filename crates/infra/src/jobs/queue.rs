//! Per-category job queues with at-least-once delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::types::{JobCategory, JobId, JobPayload};

/// Message pushed onto a category queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub job_id: JobId,
    pub category: JobCategory,
    pub payload: JobPayload,
}

impl QueueMessage {
    pub fn new(job_id: JobId, payload: JobPayload) -> Self {
        Self {
            job_id,
            category: payload.category(),
            payload,
        }
    }
}

/// A message handed to one consumer; must be acked before the visibility timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: String,
    pub message: QueueMessage,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue message encoding failed: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn push(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Make the message visible after `delay`.
    async fn push_delayed(&self, message: QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message of `category`.
    async fn pull(
        &self,
        category: JobCategory,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery. Unknown or already-acked deliveries are ignored.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Whether a message for `job_id` is ready, delayed or in flight.
    async fn is_queued(&self, category: JobCategory, job_id: JobId) -> Result<bool, QueueError>;

    async fn depth(&self, category: JobCategory) -> Result<QueueDepth, QueueError>;
}

#[derive(Debug)]
struct Entry {
    message: QueueMessage,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Lane {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<String, InFlight>,
}

impl Lane {
    /// Move due delayed messages and expired deliveries back to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push_back(entry);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(f) = self.in_flight.remove(&id) {
                debug!(job_id = %f.entry.message.job_id, "visibility timeout expired; redelivering");
                self.ready.push_front(f.entry);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.delayed
            .iter()
            .map(|(at, _)| *at)
            .chain(self.in_flight.values().map(|f| f.deadline))
            .min()
    }
}

/// In-process queue for tests and single-node deployments.
///
/// FIFO per category; unacked deliveries are redelivered once the visibility
/// timeout elapses.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    lanes: Mutex<HashMap<JobCategory, Lane>>,
    notify: HashMap<JobCategory, Arc<Notify>>,
    visibility_timeout: Duration,
    closed: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            notify: JobCategory::ALL
                .into_iter()
                .map(|c| (c, Arc::new(Notify::new())))
                .collect(),
            visibility_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn arc(visibility_timeout: Duration) -> Arc<Self> {
        Arc::new(Self::new(visibility_timeout))
    }

    /// Stop accepting messages; every push fails with `Unavailable` afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn lanes(&self) -> Result<MutexGuard<'_, HashMap<JobCategory, Lane>>, QueueError> {
        self.lanes
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("queue is closed".to_string()));
        }
        Ok(())
    }

    fn wake(&self, category: JobCategory) {
        if let Some(n) = self.notify.get(&category) {
            n.notify_waiters();
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(900))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn push(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.ensure_open()?;
        let category = message.category;
        self.lanes()?.entry(category).or_default().ready.push_back(Entry {
            message,
            deliveries: 0,
        });
        self.wake(category);
        Ok(())
    }

    async fn push_delayed(&self, message: QueueMessage, delay: Duration) -> Result<(), QueueError> {
        if delay.is_zero() {
            return self.push(message).await;
        }
        self.ensure_open()?;
        let category = message.category;
        self.lanes()?.entry(category).or_default().delayed.push((
            Instant::now() + delay,
            Entry {
                message,
                deliveries: 0,
            },
        ));
        // waiters recompute their next wakeup
        self.wake(category);
        Ok(())
    }

    async fn pull(
        &self,
        category: JobCategory,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let notify = self
            .notify
            .get(&category)
            .cloned()
            .ok_or_else(|| QueueError::Unavailable(format!("no lane for {category}")))?;
        let give_up = Instant::now() + wait;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wakeup = {
                let mut lanes = self.lanes()?;
                let lane = lanes.entry(category).or_default();
                let now = Instant::now();
                lane.promote(now);

                if let Some(mut entry) = lane.ready.pop_front() {
                    entry.deliveries += 1;
                    let delivery = Delivery {
                        delivery_id: Uuid::now_v7().to_string(),
                        message: entry.message.clone(),
                        delivery_count: entry.deliveries,
                    };
                    debug!(
                        consumer,
                        job_id = %delivery.message.job_id,
                        delivery_count = delivery.delivery_count,
                        "delivered"
                    );
                    lane.in_flight.insert(
                        delivery.delivery_id.clone(),
                        InFlight {
                            entry,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(delivery));
                }
                lane.next_wakeup()
            };

            let now = Instant::now();
            if now >= give_up {
                return Ok(None);
            }
            let until = next_wakeup.map_or(give_up, |t| t.min(give_up));
            let _ = tokio::time::timeout_at(until, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut lanes = self.lanes()?;
        if let Some(lane) = lanes.get_mut(&delivery.message.category) {
            lane.in_flight.remove(&delivery.delivery_id);
        }
        Ok(())
    }

    async fn is_queued(&self, category: JobCategory, job_id: JobId) -> Result<bool, QueueError> {
        let lanes = self.lanes()?;
        let Some(lane) = lanes.get(&category) else {
            return Ok(false);
        };
        let queued = lane.ready.iter().any(|e| e.message.job_id == job_id)
            || lane.delayed.iter().any(|(_, e)| e.message.job_id == job_id)
            || lane.in_flight.values().any(|f| f.entry.message.job_id == job_id);
        Ok(queued)
    }

    async fn depth(&self, category: JobCategory) -> Result<QueueDepth, QueueError> {
        let lanes = self.lanes()?;
        Ok(lanes
            .get(&category)
            .map(|lane| QueueDepth {
                ready: lane.ready.len() as u64,
                delayed: lane.delayed.len() as u64,
                in_flight: lane.in_flight.len() as u64,
            })
            .unwrap_or_default())
    }
}
