//! # Redis
//!
//! Shared cache for every process serving reads.
//!
//! - Values are JSON strings written with `SET key value PX ttl`
//! - Keys are namespaced as `<prefix>:<cache key>`
//! - Prefix invalidation walks `SCAN MATCH` cursors and deletes each page
use std::time::Duration;

use ::redis::aio::{ConnectionManager, ConnectionManagerConfig};
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;

use super::CacheBackend;
use crate::error::CacheError;

const SCAN_BATCH: usize = 200;

pub struct RedisCache {
    connection: ConnectionManager,
    namespace: String,
}

impl RedisCache {
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, CacheError> {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(500));

        let client = Client::open(redis_url)?;
        let connection = client.get_connection_manager_with_config(config).await?;

        Ok(Self {
            connection,
            namespace: namespace.to_string(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

/// Escape glob metacharacters so a cache key prefix matches literally.
fn escape_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(self.namespaced(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut connection = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let _: () = ::redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}*", escape_pattern(&self.namespaced(prefix)));
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;

            if !keys.is_empty() {
                let deleted: usize = connection.del(&keys).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_pattern("alerts:"), "alerts:");
        assert_eq!(
            escape_pattern("company:name=Acme*[EU]"),
            "company:name=Acme\\*\\[EU\\]"
        );
    }
}
