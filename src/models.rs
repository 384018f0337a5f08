use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Review workflow. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Pending,
    Reviewing,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Reviewing => "REVIEWING",
            AlertStatus::Resolved => "RESOLVED",
        }
    }

    /// Status after a processing pass picks the alert up.
    pub fn advance_for_review(self) -> Self {
        match self {
            AlertStatus::Pending => AlertStatus::Reviewing,
            other => other,
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(AlertStatus::Pending),
            "REVIEWING" => Ok(AlertStatus::Reviewing),
            "RESOLVED" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub company_name: String,
    pub violation_type: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub amount: f64,
    pub region: String,
    pub detected_at: DateTime<Utc>,
    pub total_violations_count: i64,
    pub company_risk_score: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_id: impl Into<String>,
        company_name: impl Into<String>,
        violation_type: impl Into<String>,
        severity: Severity,
        amount: f64,
        region: impl Into<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            alert_id: alert_id.into(),
            company_name: company_name.into(),
            violation_type: violation_type.into(),
            severity,
            status: AlertStatus::Pending,
            amount,
            region: region.into(),
            detected_at,
            total_violations_count: 0,
            company_risk_score: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.alert_id.trim().is_empty() {
            return Err("alert_id must not be empty".to_string());
        }
        if self.company_name.trim().is_empty() {
            return Err(format!("alert {} has no company", self.alert_id));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(format!(
                "alert {} has invalid amount {}",
                self.alert_id, self.amount
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyAggregate {
    pub company_name: String,
    pub total_violations: i64,
    pub total_amount: f64,
    pub risk_score: f64,
    pub last_violation_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStatistic {
    pub date: NaiveDate,
    pub total_alerts: i64,
    pub critical_alerts: i64,
    pub high_alerts: i64,
    pub medium_alerts: i64,
    pub low_alerts: i64,
    pub total_amount: f64,
}

impl DailyStatistic {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_alerts: 0,
            critical_alerts: 0,
            high_alerts: 0,
            medium_alerts: 0,
            low_alerts: 0,
            total_amount: 0.0,
        }
    }

    pub fn record(&mut self, alert: &Alert) {
        self.total_alerts += 1;
        self.total_amount += alert.amount;
        match alert.severity {
            Severity::Critical => self.critical_alerts += 1,
            Severity::High => self.high_alerts += 1,
            Severity::Medium => self.medium_alerts += 1,
            Severity::Low => self.low_alerts += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub total: i64,
    pub critical: i64,
    pub high: i64,
    pub pending: i64,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub critical_alerts: i64,
    pub high_alerts: i64,
    pub medium_alerts: i64,
    pub low_alerts: i64,
}

impl From<&DailyStatistic> for TrendPoint {
    fn from(stat: &DailyStatistic) -> Self {
        Self {
            date: stat.date,
            critical_alerts: stat.critical_alerts,
            high_alerts: stat.high_alerts,
            medium_alerts: stat.medium_alerts,
            low_alerts: stat.low_alerts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRanking {
    pub company_name: String,
    pub risk_score: f64,
    pub total_violations: i64,
}

impl From<&CompanyAggregate> for CompanyRanking {
    fn from(aggregate: &CompanyAggregate) -> Self {
        Self {
            company_name: aggregate.company_name.clone(),
            risk_score: aggregate.risk_score,
            total_violations: aggregate.total_violations,
        }
    }
}

/// Filter predicates for the alert listing. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub region: Option<String>,
    pub company_name: Option<String>,
    pub detected_from: Option<DateTime<Utc>>,
    pub detected_to: Option<DateTime<Utc>>,
}

impl AlertFilter {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.severity.map_or(true, |s| alert.severity == s)
            && self.status.map_or(true, |s| alert.status == s)
            && self
                .region
                .as_deref()
                .map_or(true, |r| alert.region == r)
            && self
                .company_name
                .as_deref()
                .map_or(true, |c| alert.company_name == c)
            && self.detected_from.map_or(true, |from| alert.detected_at >= from)
            && self.detected_to.map_or(true, |to| alert.detected_at < to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 50;
    pub const MAX_PAGE_SIZE: u32 = 500;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size: page_size.min(Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, Self::DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPage {
    pub count: u64,
    pub page: u32,
    pub page_size: u32,
    pub results: Vec<Alert>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_alert() -> Alert {
        Alert::new(
            "A-1",
            "TechCorp",
            "insider_trading",
            Severity::High,
            25_000.0,
            "EU",
            Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap(),
        )
    }

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
        assert_eq!("critical".parse::<Severity>(), Ok(Severity::Critical));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn status_never_moves_backwards() {
        assert_eq!(AlertStatus::Pending.advance_for_review(), AlertStatus::Reviewing);
        assert_eq!(AlertStatus::Reviewing.advance_for_review(), AlertStatus::Reviewing);
        assert_eq!(AlertStatus::Resolved.advance_for_review(), AlertStatus::Resolved);
    }

    #[test]
    fn serializes_enums_in_upper_case() {
        let json = serde_json::to_value(sample_alert()).unwrap();
        assert_eq!(json["severity"], "HIGH");
        assert_eq!(json["status"], "PENDING");
    }

    #[test]
    fn validation_rejects_negative_amounts() {
        let mut alert = sample_alert();
        assert!(alert.validate().is_ok());
        alert.amount = -1.0;
        assert!(alert.validate().is_err());
    }

    #[test]
    fn filter_matches_on_every_predicate() {
        let alert = sample_alert();
        let filter = AlertFilter {
            severity: Some(Severity::High),
            region: Some("EU".to_string()),
            detected_from: Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()),
            ..AlertFilter::default()
        };
        assert!(filter.matches(&alert));

        let other_region = AlertFilter {
            region: Some("APAC".to_string()),
            ..AlertFilter::default()
        };
        assert!(!other_region.matches(&alert));
    }

    #[test]
    fn page_size_is_capped() {
        let page = PageRequest::new(3, 10_000);
        assert_eq!(page.page_size, PageRequest::MAX_PAGE_SIZE);
        assert_eq!(page.offset(), 2 * u64::from(PageRequest::MAX_PAGE_SIZE));
    }
}
