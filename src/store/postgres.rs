use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{AggregateStore, AlertStore};
use crate::error::StoreError;
use crate::models::{
    Alert, AlertFilter, AlertPage, CompanyAggregate, DailyStatistic, PageRequest, StatisticsSummary,
};

const ALERT_COLUMNS: &str = "alert_id, company_name, violation_type, severity, status, amount, \
     region, detected_at, total_violations_count, company_risk_score, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `LIMIT` bound for a `usize` count, saturating instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn alert_from_row(row: &PgRow) -> Result<Alert, StoreError> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;

    Ok(Alert {
        alert_id: row.try_get("alert_id")?,
        company_name: row.try_get("company_name")?,
        violation_type: row.try_get("violation_type")?,
        severity: severity.parse().map_err(StoreError::Permanent)?,
        status: status.parse().map_err(StoreError::Permanent)?,
        amount: row.try_get("amount")?,
        region: row.try_get("region")?,
        detected_at: row.try_get("detected_at")?,
        total_violations_count: row.try_get("total_violations_count")?,
        company_risk_score: row.try_get("company_risk_score")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn company_from_row(row: &PgRow) -> Result<CompanyAggregate, StoreError> {
    Ok(CompanyAggregate {
        company_name: row.try_get("company_name")?,
        total_violations: row.try_get("total_violations")?,
        total_amount: row.try_get("total_amount")?,
        risk_score: row.try_get("risk_score")?,
        last_violation_date: row.try_get("last_violation_date")?,
    })
}

fn daily_from_row(row: &PgRow) -> Result<DailyStatistic, StoreError> {
    Ok(DailyStatistic {
        date: row.try_get("date")?,
        total_alerts: row.try_get("total_alerts")?,
        critical_alerts: row.try_get("critical_alerts")?,
        high_alerts: row.try_get("high_alerts")?,
        medium_alerts: row.try_get("medium_alerts")?,
        low_alerts: row.try_get("low_alerts")?,
        total_amount: row.try_get("total_amount")?,
    })
}

/// Appends `WHERE ...` for every set predicate. The column order mirrors
/// the composite indexes in the initial migration.
fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &AlertFilter) {
    builder.push(" WHERE TRUE");
    if let Some(severity) = filter.severity {
        builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(company) = &filter.company_name {
        builder.push(" AND company_name = ").push_bind(company.clone());
    }
    if let Some(region) = &filter.region {
        builder.push(" AND region = ").push_bind(region.clone());
    }
    if let Some(from) = filter.detected_from {
        builder.push(" AND detected_at >= ").push_bind(from);
    }
    if let Some(to) = filter.detected_to {
        builder.push(" AND detected_at < ").push_bind(to);
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn fetch_alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM market_supervision.risk_alerts WHERE alert_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alert_from_row).transpose()
    }

    async fn save_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        alert.validate().map_err(StoreError::Validation)?;

        let result = sqlx::query(
            r#"
            UPDATE market_supervision.risk_alerts
            SET status = $2,
                total_violations_count = $3,
                company_risk_score = $4,
                updated_at = $5
            WHERE alert_id = $1
            "#,
        )
        .bind(&alert.alert_id)
        .bind(alert.status.as_str())
        .bind(alert.total_violations_count)
        .bind(alert.company_risk_score)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(alert.alert_id.clone()));
        }
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<bool, StoreError> {
        alert.validate().map_err(StoreError::Validation)?;

        let result = sqlx::query(
            r#"
            INSERT INTO market_supervision.risk_alerts
            (alert_id, company_name, violation_type, severity, status, amount, region,
             detected_at, total_violations_count, company_risk_score, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (alert_id) DO NOTHING
            "#,
        )
        .bind(&alert.alert_id)
        .bind(&alert.company_name)
        .bind(&alert.violation_type)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(alert.amount)
        .bind(&alert.region)
        .bind(alert.detected_at)
        .bind(alert.total_violations_count)
        .bind(alert.company_risk_score)
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_alerts(
        &self,
        filter: &AlertFilter,
        page: PageRequest,
    ) -> Result<AlertPage, StoreError> {
        let mut count_query =
            QueryBuilder::<Postgres>::new(
                "SELECT COUNT(*) AS total FROM market_supervision.risk_alerts",
            );
        push_filter(&mut count_query, filter);
        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut select = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ALERT_COLUMNS} FROM market_supervision.risk_alerts"
        ));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY detected_at DESC, alert_id ASC LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));

        let rows = select.build().fetch_all(&self.pool).await?;
        let results = rows.iter().map(alert_from_row).collect::<Result<Vec<_>, _>>()?;

        Ok(AlertPage {
            count: total.max(0) as u64,
            page: page.page,
            page_size: page.page_size,
            results,
        })
    }

    async fn alerts_for_company(&self, company_name: &str) -> Result<Vec<Alert>, StoreError> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM market_supervision.risk_alerts \
             WHERE company_name = $1 ORDER BY detected_at"
        );
        let rows = sqlx::query(&query)
            .bind(company_name)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn alerts_since(&self, since: DateTime<Utc>) -> Result<Vec<Alert>, StoreError> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM market_supervision.risk_alerts \
             WHERE detected_at >= $1 ORDER BY detected_at"
        );
        let rows = sqlx::query(&query).bind(since).fetch_all(&self.pool).await?;

        rows.iter().map(alert_from_row).collect()
    }

    async fn distinct_companies(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT company_name FROM market_supervision.risk_alerts \
             ORDER BY company_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut companies: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            companies.push(row.try_get("company_name")?);
        }
        Ok(companies)
    }

    async fn summarize_since(&self, since: DateTime<Utc>) -> Result<StatisticsSummary, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE severity = 'CRITICAL') AS critical,
                   COUNT(*) FILTER (WHERE severity = 'HIGH') AS high,
                   COUNT(*) FILTER (WHERE status = 'PENDING') AS pending,
                   COALESCE(SUM(amount), 0)::DOUBLE PRECISION AS total_amount
            FROM market_supervision.risk_alerts
            WHERE detected_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(StatisticsSummary {
            total: row.try_get("total")?,
            critical: row.try_get("critical")?,
            high: row.try_get("high")?,
            pending: row.try_get("pending")?,
            total_amount: row.try_get("total_amount")?,
        })
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn fetch_company(
        &self,
        company_name: &str,
    ) -> Result<Option<CompanyAggregate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT company_name, total_violations, total_amount, risk_score, last_violation_date
            FROM market_supervision.company_profiles
            WHERE company_name = $1
            "#,
        )
        .bind(company_name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(company_from_row).transpose()
    }

    async fn replace_company(&self, aggregate: &CompanyAggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_supervision.company_profiles
            (company_name, total_violations, total_amount, risk_score, last_violation_date)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (company_name) DO UPDATE
            SET total_violations = EXCLUDED.total_violations,
                total_amount = EXCLUDED.total_amount,
                risk_score = EXCLUDED.risk_score,
                last_violation_date = EXCLUDED.last_violation_date
            "#,
        )
        .bind(&aggregate.company_name)
        .bind(aggregate.total_violations)
        .bind(aggregate.total_amount)
        .bind(aggregate.risk_score)
        .bind(aggregate.last_violation_date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn top_companies(&self, limit: usize) -> Result<Vec<CompanyAggregate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT company_name, total_violations, total_amount, risk_score, last_violation_date
            FROM market_supervision.company_profiles
            ORDER BY risk_score DESC, company_name ASC
            LIMIT $1
            "#,
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(company_from_row).collect()
    }

    async fn upsert_daily(&self, stat: &DailyStatistic) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO market_supervision.daily_statistics
            (date, total_alerts, critical_alerts, high_alerts,
             medium_alerts, low_alerts, total_amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (date) DO UPDATE
            SET total_alerts = EXCLUDED.total_alerts,
                critical_alerts = EXCLUDED.critical_alerts,
                high_alerts = EXCLUDED.high_alerts,
                medium_alerts = EXCLUDED.medium_alerts,
                low_alerts = EXCLUDED.low_alerts,
                total_amount = EXCLUDED.total_amount
            "#,
        )
        .bind(stat.date)
        .bind(stat.total_alerts)
        .bind(stat.critical_alerts)
        .bind(stat.high_alerts)
        .bind(stat.medium_alerts)
        .bind(stat.low_alerts)
        .bind(stat.total_amount)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn daily_since(&self, since: NaiveDate) -> Result<Vec<DailyStatistic>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT date, total_alerts, critical_alerts, high_alerts,
                medium_alerts, low_alerts, total_amount
            FROM market_supervision.daily_statistics
            WHERE date >= $1
            ORDER BY date
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(daily_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_limits_saturate() {
        assert_eq!(sql_limit(10), 10);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
