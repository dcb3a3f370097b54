//! In-process TTL cache for tests/dev.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Cache, CacheError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Entry>,
    /// Expiry index; may hold stale pairs for keys overwritten or deleted since.
    expiry: BTreeSet<(Instant, String)>,
}

impl Entries {
    /// Drop every entry whose deadline has passed.
    fn evict_expired(&mut self, now: Instant) {
        while let Some((at, _)) = self.expiry.first() {
            if *at > now {
                break;
            }
            let Some((at, key)) = self.expiry.pop_first() else {
                break;
            };
            if self.map.get(&key).is_some_and(|e| e.expires_at == Some(at)) {
                self.map.remove(&key);
            }
        }
    }
}

/// Expired entries are dropped on read of the same key and swept on every write.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<Entries>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|e| e.map.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.read().map(|e| e.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Unavailable("cache lock poisoned".to_string())
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(poisoned)?;
            match entries.map.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().map_err(poisoned)?;
        if entries.map.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.evict_expired(now);
        if let Some(at) = expires_at {
            entries.expiry.insert((at, key.to_string()));
        }
        entries.map.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().map_err(poisoned)?.map.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let cache = InMemoryCache::new();
        cache.set("a", "1".into(), None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));

        cache.delete("a").await.unwrap();
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryCache::new();
        cache
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        cache.set("forever", "v".into(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.get("forever").await.unwrap().is_some());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_keys_that_are_never_read() {
        let cache = InMemoryCache::new();
        for i in 0..1000 {
            cache
                .set(&format!("job:{i}"), "v".into(), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(cache.stored(), 1000);

        tokio::time::advance(Duration::from_secs(10)).await;
        cache.set("fresh", "v".into(), Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(cache.stored(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overwritten_key_keeps_its_newer_ttl() {
        let cache = InMemoryCache::new();
        cache.set("k", "old".into(), Some(Duration::from_secs(1))).await.unwrap();
        cache.set("k", "new".into(), Some(Duration::from_secs(60))).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        cache.set("other", "v".into(), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }
}
