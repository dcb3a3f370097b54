//! Redis Streams-backed job queue (feature `redis`).
//!
//! ## Layout
//!
//! - **Stream**: `moodscope:jobs:{category}`, one per category
//! - **Consumer group**: `moodscope-workers`, shared by every worker of a category
//! - **Delayed set**: `moodscope:jobs:{category}:delayed`, a ZSET scored by due time (ms)
//! - **Queued counts**: `moodscope:jobs:{category}:queued`, a HASH of job id to the
//!   number of unacked messages for that job
//!
//! A pull first promotes due delayed messages, then reclaims deliveries idle
//! past the visibility timeout (XPENDING + XCLAIM), then blocks on XREADGROUP.
//! Acked entries are XACKed and XDELed so XLEN tracks live messages. Pushes bump
//! the job's queued count in the same MULTI; the ack script decrements it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadReply};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::queue::{Delivery, JobQueue, QueueDepth, QueueError, QueueMessage};
use super::types::{JobCategory, JobId};

const STREAM_PREFIX: &str = "moodscope:jobs";
const CONSUMER_GROUP: &str = "moodscope-workers";
const PROMOTE_BATCH: usize = 32;

/// KEYS: stream, queued hash. ARGV: group, entry id, job id.
const ACK_SCRIPT: &str = r"
local acked = redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
if acked == 1 then
    local left = redis.call('HINCRBY', KEYS[2], ARGV[3], -1)
    if left <= 0 then
        redis.call('HDEL', KEYS[2], ARGV[3])
    end
end
return acked
";

/// Delayed entry; the nonce keeps identical messages distinct in the ZSET.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedEntry {
    nonce: Uuid,
    message: QueueMessage,
}

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    visibility_timeout: Duration,
}

impl RedisJobQueue {
    /// Open the client and make sure every category's stream and group exist.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let queue = Self {
            client: Arc::new(client),
            visibility_timeout,
        };
        queue
            .run(|conn| {
                for category in JobCategory::ALL {
                    ensure_consumer_group(conn, &stream_key(category));
                }
                Ok(())
            })
            .await?;
        Ok(queue)
    }

    async fn run<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client.get_connection().map_err(unavailable)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| QueueError::Unavailable(format!("redis task failed: {e}")))?
    }
}

fn stream_key(category: JobCategory) -> String {
    format!("{STREAM_PREFIX}:{}", category.as_str())
}

fn delayed_key(category: JobCategory) -> String {
    format!("{}:delayed", stream_key(category))
}

fn queued_key(category: JobCategory) -> String {
    format!("{}:queued", stream_key(category))
}

fn unavailable(e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// XGROUP CREATE ... MKSTREAM; an existing group is not an error.
fn ensure_consumer_group(conn: &mut redis::Connection, stream: &str) {
    let _: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(CONSUMER_GROUP)
        .arg("0")
        .arg("MKSTREAM")
        .query(conn);
}

fn encode(message: &QueueMessage) -> Result<String, QueueError> {
    serde_json::to_string(message).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn xadd_cmd(stream: &str, message: &QueueMessage) -> Result<redis::Cmd, QueueError> {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream)
        .arg("*")
        .arg("job_id")
        .arg(message.job_id.to_string())
        .arg("payload")
        .arg(encode(message)?);
    Ok(cmd)
}

fn xadd(conn: &mut redis::Connection, stream: &str, message: &QueueMessage) -> Result<String, QueueError> {
    xadd_cmd(stream, message)?
        .query(conn)
        .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))
}

fn count_queued(pipe: &mut redis::Pipeline, message: &QueueMessage) {
    pipe.cmd("HINCRBY")
        .arg(queued_key(message.category))
        .arg(message.job_id.to_string())
        .arg(1)
        .ignore();
}

fn decode(entry: &StreamId, delivery_count: u32) -> Result<Delivery, QueueError> {
    let payload: String = entry
        .get("payload")
        .ok_or_else(|| QueueError::Serialization(format!("entry {} has no payload", entry.id)))?;
    let message: QueueMessage =
        serde_json::from_str(&payload).map_err(|e| QueueError::Serialization(e.to_string()))?;
    Ok(Delivery {
        delivery_id: entry.id.clone(),
        message,
        delivery_count,
    })
}

/// Move due entries from the delayed set onto the stream.
fn promote_delayed(conn: &mut redis::Connection, category: JobCategory) -> Result<(), QueueError> {
    let delayed = delayed_key(category);
    let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
        .arg(&delayed)
        .arg("-inf")
        .arg(now_ms())
        .arg("LIMIT")
        .arg(0)
        .arg(PROMOTE_BATCH)
        .query(conn)
        .map_err(|e| QueueError::Unavailable(format!("ZRANGEBYSCORE failed: {e}")))?;

    for member in due {
        // Only the consumer that removes the member promotes it.
        let removed: u64 = redis::cmd("ZREM")
            .arg(&delayed)
            .arg(&member)
            .query(conn)
            .map_err(|e| QueueError::Unavailable(format!("ZREM failed: {e}")))?;
        if removed != 1 {
            continue;
        }
        match serde_json::from_str::<DelayedEntry>(&member) {
            Ok(entry) => {
                xadd(conn, &stream_key(category), &entry.message)?;
            }
            Err(e) => warn!(error = %e, "dropping undecodable delayed entry"),
        }
    }
    Ok(())
}

/// Claim one delivery idle past the visibility timeout, if any.
fn reclaim_stalled(
    conn: &mut redis::Connection,
    category: JobCategory,
    consumer: &str,
    min_idle: Duration,
) -> Result<Option<Delivery>, QueueError> {
    let stream = stream_key(category);
    let min_idle_ms = min_idle.as_millis() as u64;
    let pending: StreamPendingCountReply = redis::cmd("XPENDING")
        .arg(&stream)
        .arg(CONSUMER_GROUP)
        .arg("IDLE")
        .arg(min_idle_ms)
        .arg("-")
        .arg("+")
        .arg(1)
        .query(conn)
        .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;

    let Some(stalled) = pending.ids.into_iter().next() else {
        return Ok(None);
    };

    let claimed: StreamClaimReply = redis::cmd("XCLAIM")
        .arg(&stream)
        .arg(CONSUMER_GROUP)
        .arg(consumer)
        .arg(min_idle_ms)
        .arg(&stalled.id)
        .query(conn)
        .map_err(|e| QueueError::Unavailable(format!("XCLAIM failed: {e}")))?;

    match claimed.ids.first() {
        Some(entry) => {
            debug!(entry_id = %entry.id, previous_consumer = %stalled.consumer, "reclaimed stalled delivery");
            decode(entry, stalled.times_delivered as u32 + 1).map(Some)
        }
        // Entry was deleted or claimed by someone else in between.
        None => Ok(None),
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, message), fields(job_id = %message.job_id, category = %message.category), err)]
    async fn push(&self, message: QueueMessage) -> Result<(), QueueError> {
        let xadd = xadd_cmd(&stream_key(message.category), &message)?;
        self.run(move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic().add_command(xadd).ignore();
            count_queued(&mut pipe, &message);
            pipe.query::<()>(conn)
                .map_err(|e| QueueError::Unavailable(format!("XADD failed: {e}")))
        })
        .await
    }

    #[instrument(skip(self, message), fields(job_id = %message.job_id, category = %message.category), err)]
    async fn push_delayed(&self, message: QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let due = now_ms() + delay.as_millis() as i64;
        let key = delayed_key(message.category);
        let entry = DelayedEntry {
            nonce: Uuid::now_v7(),
            message,
        };
        let member =
            serde_json::to_string(&entry).map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.run(move |conn| {
            let mut pipe = redis::pipe();
            pipe.atomic().cmd("ZADD").arg(&key).arg(due).arg(&member).ignore();
            count_queued(&mut pipe, &entry.message);
            pipe.query::<()>(conn)
                .map_err(|e| QueueError::Unavailable(format!("ZADD failed: {e}")))
        })
        .await
    }

    async fn pull(
        &self,
        category: JobCategory,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let consumer = consumer.to_string();
        let visibility_timeout = self.visibility_timeout;
        // BLOCK 0 would wait forever.
        let block_ms = wait.as_millis().max(1) as u64;

        self.run(move |conn| {
            promote_delayed(conn, category)?;

            if let Some(delivery) = reclaim_stalled(conn, category, &consumer, visibility_timeout)? {
                return Ok(Some(delivery));
            }

            let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(CONSUMER_GROUP)
                .arg(&consumer)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(block_ms)
                .arg("STREAMS")
                .arg(stream_key(category))
                .arg(">")
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("XREADGROUP failed: {e}")))?;

            let entry = reply
                .and_then(|r| r.keys.into_iter().next())
                .and_then(|k| k.ids.into_iter().next());
            entry.map(|e| decode(&e, 1)).transpose()
        })
        .await
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.message.job_id, entry_id = %delivery.delivery_id), err)]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let category = delivery.message.category;
        let entry_id = delivery.delivery_id.clone();
        let job_id = delivery.message.job_id.to_string();
        self.run(move |conn| {
            let script = redis::Script::new(ACK_SCRIPT);
            script
                .key(stream_key(category))
                .key(queued_key(category))
                .arg(CONSUMER_GROUP)
                .arg(&entry_id)
                .arg(&job_id)
                .invoke::<u64>(conn)
                .map(|_| ())
                .map_err(|e| QueueError::Unavailable(format!("XACK failed: {e}")))
        })
        .await
    }

    async fn is_queued(&self, category: JobCategory, job_id: JobId) -> Result<bool, QueueError> {
        self.run(move |conn| {
            let count: Option<i64> = redis::cmd("HGET")
                .arg(queued_key(category))
                .arg(job_id.to_string())
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("HGET failed: {e}")))?;
            Ok(count.is_some_and(|n| n > 0))
        })
        .await
    }

    async fn depth(&self, category: JobCategory) -> Result<QueueDepth, QueueError> {
        self.run(move |conn| {
            let stream = stream_key(category);
            let len: u64 = redis::cmd("XLEN")
                .arg(&stream)
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("XLEN failed: {e}")))?;
            let pending: StreamPendingReply = redis::cmd("XPENDING")
                .arg(&stream)
                .arg(CONSUMER_GROUP)
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("XPENDING failed: {e}")))?;
            let delayed: u64 = redis::cmd("ZCARD")
                .arg(delayed_key(category))
                .query(conn)
                .map_err(|e| QueueError::Unavailable(format!("ZCARD failed: {e}")))?;

            let in_flight = pending.count() as u64;
            Ok(QueueDepth {
                ready: len.saturating_sub(in_flight),
                delayed,
                in_flight,
            })
        })
        .await
    }
}
