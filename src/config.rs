use std::{env, fmt::Display, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use tracing::info;

use crate::dispatcher::RetryPolicy;
use crate::risk;

/// Per-endpoint cache lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub statistics: Duration,
    pub trends: Duration,
    pub top_companies: Duration,
    pub alerts: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            statistics: Duration::from_secs(300),
            trends: Duration::from_secs(600),
            top_companies: Duration::from_secs(900),
            alerts: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub worker_pool_size: usize,
    pub retry: RetryPolicy,
    pub store_timeout: Duration,
    pub batch_retention: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            retry: RetryPolicy::default(),
            store_timeout: Duration::from_secs(5),
            batch_retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSettings {
    pub interval: Duration,
    pub trend_window_days: i64,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 60 * 60),
            trend_window_days: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub cache_key_prefix: String,
    pub dispatcher: DispatcherSettings,
    pub cache_ttls: CacheTtls,
    pub rebuild: RebuildSettings,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset keys fall back to the
    /// documented defaults; set but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let worker_pool_size: usize = try_load(&lookup, "WORKER_POOL_SIZE", 4)?;
        if worker_pool_size == 0 {
            return Err(anyhow!("WORKER_POOL_SIZE must be at least 1"));
        }
        let max_attempts: u32 = try_load(&lookup, "RETRY_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(anyhow!("RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        let trend_window_days: i64 = try_load(&lookup, "TREND_WINDOW_DAYS", 30)?;
        if !(1..=risk::MAX_WINDOW_DAYS).contains(&trend_window_days) {
            return Err(anyhow!(
                "TREND_WINDOW_DAYS must be between 1 and {}",
                risk::MAX_WINDOW_DAYS
            ));
        }

        Ok(Self {
            database_url,
            database_max_connections: try_load(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            redis_url: lookup("REDIS_URL").filter(|url| !url.trim().is_empty()),
            cache_key_prefix: try_load(
                &lookup,
                "CACHE_KEY_PREFIX",
                "market_supervision".to_string(),
            )?,
            dispatcher: DispatcherSettings {
                worker_pool_size,
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: Duration::from_millis(try_load(
                        &lookup,
                        "RETRY_BASE_DELAY_MS",
                        1000,
                    )?),
                },
                store_timeout: Duration::from_millis(try_load(&lookup, "STORE_TIMEOUT_MS", 5000)?),
                batch_retention: secs(&lookup, "BATCH_RETENTION_SECS", 3600)?,
            },
            cache_ttls: CacheTtls {
                statistics: secs(&lookup, "STATISTICS_TTL_SECS", 300)?,
                trends: secs(&lookup, "TRENDS_TTL_SECS", 600)?,
                top_companies: secs(&lookup, "TOP_COMPANIES_TTL_SECS", 900)?,
                alerts: secs(&lookup, "ALERTS_TTL_SECS", 60)?,
            },
            rebuild: RebuildSettings {
                interval: secs(&lookup, "REBUILD_INTERVAL_SECS", 6 * 60 * 60)?,
                trend_window_days,
            },
        })
    }
}

fn try_load<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {key} value {raw:?}: {e}")),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    try_load(lookup, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings =
            Settings::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://localhost/risk")]))
                .unwrap();

        assert_eq!(settings.dispatcher, DispatcherSettings::default());
        assert_eq!(settings.cache_ttls, CacheTtls::default());
        assert_eq!(settings.rebuild, RebuildSettings::default());
        assert_eq!(settings.redis_url, None);
        assert_eq!(settings.cache_key_prefix, "market_supervision");
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/risk"),
            ("REDIS_URL", "redis://cache:6379/1"),
            ("WORKER_POOL_SIZE", "8"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("STATISTICS_TTL_SECS", "30"),
            ("TREND_WINDOW_DAYS", "14"),
        ]))
        .unwrap();

        assert_eq!(settings.dispatcher.worker_pool_size, 8);
        assert_eq!(settings.dispatcher.retry.base_delay, Duration::from_millis(250));
        assert_eq!(settings.cache_ttls.statistics, Duration::from_secs(30));
        assert_eq!(settings.rebuild.trend_window_days, 14);
        assert_eq!(settings.redis_url.as_deref(), Some("redis://cache:6379/1"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let result = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/risk"),
            ("WORKER_POOL_SIZE", "many"),
        ]));
        assert!(result.is_err());

        let zero_pool = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/risk"),
            ("WORKER_POOL_SIZE", "0"),
        ]));
        assert!(zero_pool.is_err());

        let endless_window = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/risk"),
            ("TREND_WINDOW_DAYS", "1000000"),
        ]));
        assert!(endless_window.is_err());
    }

    #[test]
    fn database_url_is_required() {
        assert!(Settings::from_lookup(lookup_from(&[])).is_err());
    }
}
