use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::CacheBackend;
use crate::error::CacheError;

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local cache. Expiry follows the tokio clock, and an entry is
/// expired from the instant its TTL elapses.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entry_expires_exactly_at_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("statistics:", "{\"total\":3}".to_string(), Duration::from_secs(300))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(
            cache.get("statistics:").await.unwrap().as_deref(),
            Some("{\"total\":3}")
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("statistics:").await.unwrap(), None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_restarts_ttl() {
        let cache = MemoryCache::new();
        cache.set("trends:days=30", "a".into(), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("trends:days=30", "b".into(), Duration::from_secs(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("trends:days=30").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_prefix_leaves_other_endpoints() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("alerts:region=EU", "1".into(), ttl).await.unwrap();
        cache.set("alerts:severity=HIGH", "2".into(), ttl).await.unwrap();
        cache.set("statistics:", "3".into(), ttl).await.unwrap();

        assert_eq!(cache.delete_prefix("alerts:").await.unwrap(), 2);
        assert_eq!(cache.get("alerts:region=EU").await.unwrap(), None);
        assert_eq!(cache.get("statistics:").await.unwrap().as_deref(), Some("3"));
    }
}
