//! TTL cache in front of the read operations.
//!
//! The cache is an accelerator only. Backend faults and corrupt payloads are
//! logged and treated as misses, so callers always get a computed value.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::CacheError;

mod memory;
mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

pub const STATISTICS: &str = "statistics";
pub const TRENDS: &str = "trends";
pub const TOP_COMPANIES: &str = "top_companies";
pub const COMPANY: &str = "company";
pub const ALERTS: &str = "alerts";

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key starting with `prefix`. Returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;

    fn backend_type(&self) -> &'static str;
}

/// Deterministic key for one query shape: `endpoint:` followed by the
/// parameters sorted by name, e.g. `alerts:region=EU&severity=HIGH`.
/// Values are percent-encoded for `%`, `&` and `=` so distinct parameter
/// sets never render the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    endpoint: &'static str,
    params: Vec<(&'static str, String)>,
}

impl CacheKey {
    pub fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, encode_value(&value.to_string())));
        self
    }

    pub fn opt_param<V: ToString>(self, name: &'static str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// Prefix shared by every key of `endpoint`.
    pub fn endpoint_prefix(endpoint: &str) -> String {
        format!("{endpoint}:")
    }
}

fn encode_value(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '&' => encoded.push_str("%26"),
            '=' => encoded.push_str("%3D"),
            c => encoded.push(c),
        }
    }
    encoded
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut params: Vec<&(&'static str, String)> = self.params.iter().collect();
        params.sort();
        write!(f, "{}:", self.endpoint)?;
        for (i, (name, value)) in params.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// Serve `key` from the cache, or run `compute`, store its value for
    /// `ttl` and return it. Errors from `compute` are returned and not cached.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = key.to_string();

        match self.backend.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(value) => {
                    debug!("cache hit for {key}");
                    return Ok(value);
                }
                Err(e) => warn!("Discarding unreadable cache entry {key}: {e}"),
            },
            Ok(None) => debug!("cache miss for {key}"),
            Err(e) => warn!(
                "{} cache unavailable, computing {key} directly: {e}",
                self.backend.backend_type()
            ),
        }

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(payload) => {
                if let Err(e) = self.backend.set(&key, payload, ttl).await {
                    warn!("Failed to store cache entry {key}: {e}");
                }
            }
            Err(e) => warn!("Failed to encode cache entry {key}: {e}"),
        }

        Ok(value)
    }

    /// Remove every entry whose key starts with `key_or_prefix`.
    pub async fn invalidate(&self, key_or_prefix: &str) -> usize {
        match self.backend.delete_prefix(key_or_prefix).await {
            Ok(removed) => {
                debug!("invalidated {removed} cache entries under {key_or_prefix}");
                removed
            }
            Err(e) => {
                warn!("Failed to invalidate cache entries under {key_or_prefix}: {e}");
                0
            }
        }
    }

    pub async fn invalidate_endpoints(&self, endpoints: &[&str]) {
        for endpoint in endpoints {
            self.invalidate(&CacheKey::endpoint_prefix(endpoint)).await;
        }
    }
}
