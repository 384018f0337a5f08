//! Persistence seams for alerts and their derived aggregates.
//!
//! Two backends implement both traits: [`PgStore`] for Postgres and
//! [`MemoryStore`] for tests and local demos.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::StoreError;
use crate::models::{
    Alert, AlertFilter, AlertPage, CompanyAggregate, DailyStatistic, PageRequest, StatisticsSummary,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Source of truth for alerts. Each write touches a single alert row.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError>;

    /// Persist a processed alert. The alert must already exist.
    async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError>;

    /// Ingest a new alert. Returns `false` when the id is already present.
    async fn insert_alert(&self, alert: &Alert) -> Result<bool, StoreError>;

    /// Newest first.
    async fn list_alerts(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<AlertPage, StoreError>;

    async fn alerts_for_company(&self, company_name: &str) -> Result<Vec<Alert>, StoreError>;

    async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, StoreError>;

    async fn distinct_companies(&self) -> Result<Vec<String>, StoreError>;

    async fn summarize_since(&self, since: DateTime<Utc>) -> Result<StatisticsSummary, StoreError>;
}

/// Denormalized tables owned by the rebuild job.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn fetch_company(
        &self,
        company_name: &str,
    ) -> Result<Option<CompanyAggregate>, StoreError>;

    /// Replace the whole row for one company in a single write.
    async fn replace_company(&self, aggregate: &CompanyAggregate) -> Result<(), StoreError>;

    /// Highest risk score first.
    async fn top_companies(&self, limit: usize) -> Result<Vec<CompanyAggregate>, StoreError>;

    async fn upsert_daily(&self, stat: &DailyStatistic) -> Result<(), StoreError>;

    /// Ascending by date.
    async fn daily_since(&self, since: NaiveDate) -> Result<Vec<DailyStatistic>, StoreError>;
}
