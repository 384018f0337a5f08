use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;

use super::{AggregateStore, AlertStore};
use crate::error::StoreError;
use crate::models::{
    Alert, AlertFilter, AlertPage, CompanyAggregate, DailyStatistic, PageRequest, StatisticsSummary,
};
use crate::risk;

/// In-process store. Aggregate rows are swapped whole under the write lock,
/// so readers see either the previous or the next version of a company.
#[derive(Default)]
pub struct MemoryStore {
    alerts: RwLock<HashMap<String, Alert>>,
    companies: RwLock<HashMap<String, CompanyAggregate>>,
    daily: RwLock<BTreeMap<NaiveDate, DailyStatistic>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_alerts(alerts: impl IntoIterator<Item = Alert>) -> Self {
        let store = Self::new();
        {
            let mut map = store.alerts.write().await;
            for alert in alerts {
                map.insert(alert.alert_id.clone(), alert);
            }
        }
        store
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
        Ok(self.alerts.read().await.get(alert_id).cloned())
    }

    async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        alert.validate().map_err(StoreError::Validation)?;
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(&alert.alert_id) {
            Some(existing) => {
                *existing = alert.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(alert.alert_id.clone())),
        }
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<bool, StoreError> {
        alert.validate().map_err(StoreError::Validation)?;
        let mut alerts = self.alerts.write().await;
        if alerts.contains_key(&alert.alert_id) {
            return Ok(false);
        }
        alerts.insert(alert.alert_id.clone(), alert.clone());
        Ok(true)
    }

    async fn list_alerts(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<AlertPage, StoreError> {
        let alerts = self.alerts.read().await;
        let mut matching: Vec<&Alert> = alerts.values().filter(|a| filter.matches(a)).collect();
        matching.sort_by(|a, b| {
            b.detected_at
                .cmp(&a.detected_at)
                .then_with(|| a.alert_id.cmp(&b.alert_id))
        });

        let count = matching.len() as u64;
        let results = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .cloned()
            .collect();

        Ok(AlertPage {
            count,
            page: page.page,
            page_size: page.page_size,
            results,
        })
    }

    async fn alerts_for_company(&self, company_name: &str) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| a.company_name == company_name)
            .cloned()
            .collect())
    }

    async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
        Ok(self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| a.detected_at >= since)
            .cloned()
            .collect())
    }

    async fn distinct_companies(&self) -> Result<Vec<String>, StoreError> {
        let alerts = self.alerts.read().await;
        let mut companies: Vec<String> = alerts.values().map(|a| a.company_name.clone()).collect();
        companies.sort();
        companies.dedup();
        Ok(companies)
    }

    async fn summarize_since(&self, since: DateTime<Utc>) -> Result<StatisticsSummary, StoreError> {
        let alerts = self.alerts_since(since).await?;
        Ok(risk::summarize(&alerts))
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn fetch_company(
        &self,
        company_name: &str,
    ) -> Result<Option<CompanyAggregate>, StoreError> {
        Ok(self.companies.read().await.get(company_name).cloned())
    }

    async fn replace_company(&self, aggregate: &CompanyAggregate) -> Result<(), StoreError> {
        self.companies
            .write()
            .await
            .insert(aggregate.company_name.clone(), aggregate.clone());
        Ok(())
    }

    async fn top_companies(&self, limit: usize) -> Result<Vec<CompanyAggregate>, StoreError> {
        let companies = self.companies.read().await;
        let mut ranked: Vec<CompanyAggregate> = companies.values().cloned().collect();
        ranked.sort_by(|a, b| {
            b.risk_score
                .partial_cmp(&a.risk_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.company_name.cmp(&b.company_name))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn upsert_daily(&self, stat: &DailyStatistic) -> Result<(), StoreError> {
        self.daily.write().await.insert(stat.date, stat.clone());
        Ok(())
    }

    async fn daily_since(&self, since: NaiveDate) -> Result<Vec<DailyStatistic>, StoreError> {
        Ok(self
            .daily
            .read()
            .await
            .range(since..)
            .map(|(_, stat)| stat.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::TimeZone;

    fn alert(id: &str, company: &str, hour: u32) -> Alert {
        Alert::new(
            id,
            company,
            "wash_trading",
            Severity::Medium,
            1_000.0,
            "EU",
            Utc.with_ymd_and_hms(2026, 1, 10, hour, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_alert_id() {
        let store = MemoryStore::new();
        assert!(store.insert_alert(&alert("A-1", "TechCorp", 1)).await.unwrap());
        assert!(!store.insert_alert(&alert("A-1", "TechCorp", 2)).await.unwrap());
        let stored = store.fetch_alert("A-1").await.unwrap().unwrap();
        assert_eq!(stored.detected_at.format("%H").to_string(), "01");
    }

    #[tokio::test]
    async fn save_requires_existing_alert() {
        let store = MemoryStore::new();
        let err = store.save_alert(&alert("A-9", "TechCorp", 1)).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("A-9".to_string()));
    }

    #[tokio::test]
    async fn lists_newest_first_with_paging() {
        let store = MemoryStore::with_alerts(vec![
            alert("A-1", "TechCorp", 1),
            alert("A-2", "TechCorp", 3),
            alert("B-1", "Globex", 2),
        ])
        .await;

        let page = store
            .list_alerts(&AlertFilter::default(), PageRequest::new(1, 2))
            .await
            .unwrap();
        assert_eq!(page.count, 3);
        let ids: Vec<&str> = page.results.iter().map(|a| a.alert_id.as_str()).collect();
        assert_eq!(ids, vec!["A-2", "B-1"]);

        let second = store
            .list_alerts(&AlertFilter::default(), PageRequest::new(2, 2))
            .await
            .unwrap();
        assert_eq!(second.results.len(), 1);
        assert_eq!(second.results[0].alert_id, "A-1");
    }

    #[tokio::test]
    async fn distinct_companies_are_sorted_and_unique() {
        let store = MemoryStore::with_alerts(vec![
            alert("A-1", "TechCorp", 1),
            alert("A-2", "TechCorp", 3),
            alert("B-1", "Globex", 2),
        ])
        .await;
        assert_eq!(
            store.distinct_companies().await.unwrap(),
            vec!["Globex".to_string(), "TechCorp".to_string()]
        );
    }

    #[tokio::test]
    async fn top_companies_rank_by_score() {
        let store = MemoryStore::new();
        for (name, score) in [("Low", 1.0), ("High", 9.0), ("Mid", 4.0)] {
            store
                .replace_company(&CompanyAggregate {
                    company_name: name.to_string(),
                    total_violations: 1,
                    total_amount: 0.0,
                    risk_score: score,
                    last_violation_date: None,
                })
                .await
                .unwrap();
        }
        let top = store.top_companies(2).await.unwrap();
        let names: Vec<&str> = top.iter().map(|c| c.company_name.as_str()).collect();
        assert_eq!(names, vec!["High", "Mid"]);
    }
}
