use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::models::{
    Alert, AlertStatus, CompanyAggregate, DailyStatistic, Severity, StatisticsSummary,
};

const CRITICAL_WEIGHT: f64 = 10.0;
const HIGH_WEIGHT: f64 = 5.0;
const AMOUNT_DIVISOR: f64 = 100_000.0;

pub fn risk_score(critical_count: i64, high_count: i64, total_amount: f64) -> f64 {
    critical_count as f64 * CRITICAL_WEIGHT
        + high_count as f64 * HIGH_WEIGHT
        + total_amount / AMOUNT_DIVISOR
}

/// Full re-aggregation of one company's alerts.
pub fn aggregate_company(company_name: &str, alerts: &[Alert]) -> CompanyAggregate {
    let mut total_violations = 0;
    let mut total_amount = 0.0;
    let mut critical = 0;
    let mut high = 0;
    let mut last_violation_date: Option<DateTime<Utc>> = None;

    for alert in alerts.iter().filter(|a| a.company_name == company_name) {
        total_violations += 1;
        total_amount += alert.amount;
        match alert.severity {
            Severity::Critical => critical += 1,
            Severity::High => high += 1,
            _ => {}
        }
        if last_violation_date.map_or(true, |last| alert.detected_at > last) {
            last_violation_date = Some(alert.detected_at);
        }
    }

    CompanyAggregate {
        company_name: company_name.to_string(),
        total_violations,
        total_amount,
        risk_score: risk_score(critical, high, total_amount),
        last_violation_date,
    }
}

/// One row per date in `[start, end]`, zero-filled where nothing was detected.
pub fn daily_statistics(alerts: &[Alert], start: NaiveDate, end: NaiveDate) -> Vec<DailyStatistic> {
    let mut days: BTreeMap<NaiveDate, DailyStatistic> = BTreeMap::new();
    let mut date = start;
    while date <= end {
        days.insert(date, DailyStatistic::empty(date));
        date += Duration::days(1);
    }

    for alert in alerts {
        if let Some(stat) = days.get_mut(&alert.detected_at.date_naive()) {
            stat.record(alert);
        }
    }

    days.into_values().collect()
}

pub fn summarize(alerts: &[Alert]) -> StatisticsSummary {
    let mut summary = StatisticsSummary::default();
    for alert in alerts {
        summary.total += 1;
        summary.total_amount += alert.amount;
        match alert.severity {
            Severity::Critical => summary.critical += 1,
            Severity::High => summary.high += 1,
            _ => {}
        }
        if alert.status == AlertStatus::Pending {
            summary.pending += 1;
        }
    }
    summary
}

/// Longest lookback any read or rebuild window may use.
pub const MAX_WINDOW_DAYS: i64 = 3650;

fn window(since_days: i64) -> Duration {
    Duration::days(since_days.clamp(1, MAX_WINDOW_DAYS))
}

pub fn cutoff_date(since_days: i64) -> NaiveDate {
    Utc::now().date_naive() - window(since_days)
}

pub fn cutoff_instant(since_days: i64) -> DateTime<Utc> {
    Utc::now() - window(since_days)
}
