//! Redis-backed cache (feature `redis`).
//!
//! Uses blocking connections on the tokio blocking pool, one per call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{Cache, CacheError};

const KEY_PREFIX: &str = "moodscope:cache:";

#[derive(Debug, Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
}

impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = client
                .get_connection()
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            f(&mut conn).map_err(|e| CacheError::Unavailable(format!("{op} failed: {e}")))
        })
        .await
        .map_err(|e| CacheError::Unavailable(format!("{op} task failed: {e}")))?
    }
}

fn namespaced(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

#[async_trait]
impl Cache for RedisCache {
    #[instrument(skip(self), err)]
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = namespaced(key);
        self.run("GET", move |conn| redis::cmd("GET").arg(&key).query(conn))
            .await
    }

    #[instrument(skip(self, value), err)]
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let key = namespaced(key);
        self.run("SET", move |conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
            }
            cmd.query::<()>(conn)
        })
        .await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = namespaced(key);
        self.run("DEL", move |conn| redis::cmd("DEL").arg(&key).query::<()>(conn))
            .await
    }
}
