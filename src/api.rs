//! Read operations behind the dashboard, each a thin cache consumer, plus
//! the batch submission entry point.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{self, Cache, CacheKey};
use crate::config::CacheTtls;
use crate::dispatcher::{BatchHandle, BatchReport, DispatchError, Dispatcher};
use crate::error::StoreError;
use crate::models::{
    AlertFilter, AlertPage, CompanyAggregate, CompanyRanking, PageRequest, StatisticsSummary,
    TrendPoint,
};
use crate::risk;
use crate::store::{AggregateStore, AlertStore};

pub const DEFAULT_TOP_COMPANIES: usize = 10;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Store(#[from] StoreError),
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    #[serde(default)]
    pub alert_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAccepted {
    pub batch_id: BatchHandle,
    pub status: String,
    pub total_alerts: usize,
}

pub struct ReadApi {
    alerts: Arc<dyn AlertStore>,
    aggregates: Arc<dyn AggregateStore>,
    cache: Cache,
    dispatcher: Dispatcher,
    ttls: CacheTtls,
    window_days: i64,
}

impl ReadApi {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        aggregates: Arc<dyn AggregateStore>,
        cache: Cache,
        dispatcher: Dispatcher,
        ttls: CacheTtls,
        window_days: i64,
    ) -> Self {
        Self {
            alerts,
            aggregates,
            cache,
            dispatcher,
            ttls,
            window_days,
        }
    }

    /// Headline counts over the trailing window.
    pub async fn statistics(&self) -> Result<StatisticsSummary, ApiError> {
        let key = CacheKey::new(cache::STATISTICS).param("days", self.window_days);
        let since = risk::cutoff_instant(self.window_days);
        let summary = self
            .cache
            .get_or_compute(&key, self.ttls.statistics, || async {
                self.alerts.summarize_since(since).await
            })
            .await?;
        Ok(summary)
    }

    pub async fn trends(&self, days: i64) -> Result<Vec<TrendPoint>, ApiError> {
        if !(1..=risk::MAX_WINDOW_DAYS).contains(&days) {
            return Err(ApiError::InvalidRequest(format!(
                "days must be between 1 and {}",
                risk::MAX_WINDOW_DAYS
            )));
        }
        let key = CacheKey::new(cache::TRENDS).param("days", days);
        let since = risk::cutoff_date(days);
        let points = self
            .cache
            .get_or_compute(&key, self.ttls.trends, || async {
                let stats = self.aggregates.daily_since(since).await?;
                Ok::<_, StoreError>(stats.iter().map(TrendPoint::from).collect::<Vec<_>>())
            })
            .await?;
        Ok(points)
    }

    pub async fn top_companies(&self, limit: usize) -> Result<Vec<CompanyRanking>, ApiError> {
        if limit == 0 {
            return Err(ApiError::InvalidRequest("limit must be at least 1".to_string()));
        }
        let key = CacheKey::new(cache::TOP_COMPANIES).param("limit", limit);
        let ranking = self
            .cache
            .get_or_compute(&key, self.ttls.top_companies, || async {
                let companies = self.aggregates.top_companies(limit).await?;
                Ok::<_, StoreError>(companies.iter().map(CompanyRanking::from).collect::<Vec<_>>())
            })
            .await?;
        Ok(ranking)
    }

    pub async fn company(&self, company_name: &str) -> Result<Option<CompanyAggregate>, ApiError> {
        let key = CacheKey::new(cache::COMPANY).param("name", company_name);
        let profile = self
            .cache
            .get_or_compute(&key, self.ttls.top_companies, || async {
                self.aggregates.fetch_company(company_name).await
            })
            .await?;
        Ok(profile)
    }

    pub async fn list_alerts(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<AlertPage, ApiError> {
        if page.page == 0 || page.page_size == 0 {
            return Err(ApiError::InvalidRequest(
                "page and page_size start at 1".to_string(),
            ));
        }
        let key = alerts_key(filter, page);
        let listing = self
            .cache
            .get_or_compute(&key, self.ttls.alerts, || async {
                self.alerts.list_alerts(filter, page).await
            })
            .await?;
        Ok(listing)
    }

    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchAccepted, ApiError> {
        let total_alerts = request.alert_ids.len();
        let batch_id = self.dispatcher.submit_batch(request.alert_ids).await?;
        Ok(BatchAccepted {
            batch_id,
            status: "Processing started".to_string(),
            total_alerts,
        })
    }

    pub async fn batch_status(&self, batch_id: BatchHandle) -> Option<BatchReport> {
        self.dispatcher.batch_report(batch_id).await
    }
}

fn rfc3339(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|v| v.to_rfc3339())
}

fn alerts_key(filter: &AlertFilter, page: PageRequest) -> CacheKey {
    CacheKey::new(cache::ALERTS)
        .opt_param("severity", filter.severity)
        .opt_param("status", filter.status)
        .opt_param("region", filter.region.as_deref())
        .opt_param("company", filter.company_name.as_deref())
        .opt_param("from", rfc3339(filter.detected_from))
        .opt_param("to", rfc3339(filter.detected_to))
        .param("page", page.page)
        .param("page_size", page.page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatcherSettings, RebuildSettings};
    use crate::dispatcher::{BatchState, RetryPolicy};
    use crate::models::{Alert, AlertStatus, DailyStatistic, Severity};
    use crate::rebuild::RebuildJob;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts aggregation queries that reach the store.
    struct CountingStore {
        inner: MemoryStore,
        summaries: AtomicUsize,
        rankings: AtomicUsize,
    }

    #[async_trait]
    impl AlertStore for CountingStore {
        async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
            self.inner.fetch_alert(alert_id).await
        }

        async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
            self.inner.save_alert(alert).await
        }

        async fn insert_alert(&self, alert: &Alert) -> Result<bool, StoreError> {
            self.inner.insert_alert(alert).await
        }

        async fn list_alerts(
            &self,
            filter: &AlertFilter,
            page: PageRequest,
        ) -> Result<AlertPage, StoreError> {
            self.inner.list_alerts(filter, page).await
        }

        async fn alerts_for_company(&self, company_name: &str) -> Result<Vec<Alert>, StoreError> {
            self.inner.alerts_for_company(company_name).await
        }

        async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
            self.inner.alerts_since(since).await
        }

        async fn distinct_companies(&self) -> Result<Vec<String>, StoreError> {
            self.inner.distinct_companies().await
        }

        async fn summarize_since(
            &self,
            since: DateTime<Utc>,
        ) -> Result<StatisticsSummary, StoreError> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            self.inner.summarize_since(since).await
        }
    }

    #[async_trait]
    impl AggregateStore for CountingStore {
        async fn fetch_company(
            &self,
            company_name: &str,
        ) -> Result<Option<CompanyAggregate>, StoreError> {
            self.inner.fetch_company(company_name).await
        }

        async fn replace_company(&self, aggregate: &CompanyAggregate) -> Result<(), StoreError> {
            self.inner.replace_company(aggregate).await
        }

        async fn top_companies(&self, limit: usize) -> Result<Vec<CompanyAggregate>, StoreError> {
            self.rankings.fetch_add(1, Ordering::SeqCst);
            self.inner.top_companies(limit).await
        }

        async fn upsert_daily(&self, stat: &DailyStatistic) -> Result<(), StoreError> {
            self.inner.upsert_daily(stat).await
        }

        async fn daily_since(&self, since: NaiveDate) -> Result<Vec<DailyStatistic>, StoreError> {
            self.inner.daily_since(since).await
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        api: ReadApi,
        dispatcher: Dispatcher,
        rebuild: RebuildJob,
    }

    fn recent_alert(id: &str, company: &str, severity: Severity, amount: f64) -> Alert {
        Alert::new(
            id,
            company,
            "disclosure_breach",
            severity,
            amount,
            "NA",
            Utc::now() - ChronoDuration::hours(2),
        )
    }

    async fn harness() -> Harness {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::with_alerts(vec![
                recent_alert("A-1", "TechCorp", Severity::Critical, 500_000.0),
                recent_alert("A-2", "TechCorp", Severity::High, 10_000.0),
                recent_alert("B-1", "Globex", Severity::Medium, 2_000.0),
            ])
            .await,
            summaries: AtomicUsize::new(0),
            rankings: AtomicUsize::new(0),
        });
        let cache = Cache::in_memory();
        let dispatcher = Dispatcher::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            DispatcherSettings {
                worker_pool_size: 2,
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                },
                ..DispatcherSettings::default()
            },
        );
        let rebuild = RebuildJob::new(
            store.clone(),
            store.clone(),
            cache.clone(),
            RebuildSettings::default(),
        );
        let api = ReadApi::new(
            store.clone(),
            store.clone(),
            cache,
            dispatcher.clone(),
            CacheTtls::default(),
            30,
        );
        Harness {
            store,
            api,
            dispatcher,
            rebuild,
        }
    }

    #[tokio::test]
    async fn statistics_are_served_from_cache_within_ttl() {
        let h = harness().await;

        let first = h.api.statistics().await.unwrap();
        let second = h.api.statistics().await.unwrap();

        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.total, 3);
        assert_eq!(first.critical, 1);
        assert_eq!(first.pending, 3);
        assert_eq!(h.store.summaries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_recompute_after_ttl() {
        let h = harness().await;
        h.api.statistics().await.unwrap();
        tokio::time::advance(Duration::from_secs(300)).await;
        h.api.statistics().await.unwrap();
        assert_eq!(h.store.summaries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn processing_an_alert_refreshes_top_companies() {
        let h = harness().await;
        h.rebuild.rebuild_all().await.unwrap();

        let before = h.api.top_companies(DEFAULT_TOP_COMPANIES).await.unwrap();
        assert_eq!(before[0].company_name, "TechCorp");
        h.api.top_companies(DEFAULT_TOP_COMPANIES).await.unwrap();
        assert_eq!(h.store.rankings.load(Ordering::SeqCst), 1);

        let accepted = h
            .api
            .submit_batch(BatchRequest {
                alert_ids: vec!["A-1".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(accepted.total_alerts, 1);
        let report = h
            .dispatcher
            .wait_for_completion(accepted.batch_id, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        let status = h.api.batch_status(accepted.batch_id).await.unwrap();
        assert_eq!(status.state, BatchState::Completed);

        h.api.top_companies(DEFAULT_TOP_COMPANIES).await.unwrap();
        assert_eq!(h.store.rankings.load(Ordering::SeqCst), 2);

        let processed = h.store.fetch_alert("A-1").await.unwrap().unwrap();
        assert_eq!(processed.status, AlertStatus::Reviewing);
        assert_eq!(processed.total_violations_count, 2);
    }

    #[tokio::test]
    async fn trends_come_from_daily_statistics() {
        let h = harness().await;
        h.rebuild.rebuild_all().await.unwrap();

        let points = h.api.trends(7).await.unwrap();
        assert_eq!(points.len(), 8);
        assert!(points.windows(2).all(|w| w[0].date < w[1].date));
        let total_critical: i64 = points.iter().map(|p| p.critical_alerts).sum();
        assert_eq!(total_critical, 1);
    }

    #[tokio::test]
    async fn listing_filters_and_paginates() {
        let h = harness().await;
        let filter = AlertFilter {
            company_name: Some("TechCorp".to_string()),
            ..AlertFilter::default()
        };

        let page = h.api.list_alerts(&filter, PageRequest::new(1, 1)).await.unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.results.len(), 1);

        let high_only = AlertFilter {
            severity: Some(Severity::High),
            ..AlertFilter::default()
        };
        let page = h.api.list_alerts(&high_only, PageRequest::default()).await.unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(page.results[0].alert_id, "A-2");
    }

    #[tokio::test]
    async fn company_profile_lookup() {
        let h = harness().await;
        assert_eq!(h.api.company("TechCorp").await.unwrap(), None);

        h.rebuild.rebuild_all().await.unwrap();
        let profile = h.api.company("TechCorp").await.unwrap().unwrap();
        assert_eq!(profile.total_violations, 2);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.api.submit_batch(BatchRequest { alert_ids: vec![] }).await,
            Err(ApiError::InvalidRequest(_))
        ));
        assert!(matches!(h.api.trends(0).await, Err(ApiError::InvalidRequest(_))));
        assert!(matches!(
            h.api.trends(i64::MAX).await,
            Err(ApiError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.api.list_alerts(&AlertFilter::default(), PageRequest::new(0, 10)).await,
            Err(ApiError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn filters_with_separator_characters_get_their_own_cache_entry() {
        let h = harness().await;
        let high_in_na = AlertFilter {
            region: Some("NA".to_string()),
            severity: Some(Severity::High),
            ..AlertFilter::default()
        };
        let page = h.api.list_alerts(&high_in_na, PageRequest::default()).await.unwrap();
        assert_eq!(page.count, 1);

        let odd_region = AlertFilter {
            region: Some("NA&severity=HIGH".to_string()),
            ..AlertFilter::default()
        };
        let page = h.api.list_alerts(&odd_region, PageRequest::default()).await.unwrap();
        assert_eq!(page.count, 0);
        assert!(page.results.is_empty());
    }

    #[test]
    fn listing_keys_are_normalized() {
        let filter = AlertFilter {
            severity: Some(Severity::Critical),
            region: Some("EU".to_string()),
            ..AlertFilter::default()
        };
        assert_eq!(
            alerts_key(&filter, PageRequest::default()).to_string(),
            "alerts:page=1&page_size=50&region=EU&severity=CRITICAL"
        );
    }
}
