use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::models::{Alert, Severity};
use crate::store::AlertStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a small, realistic alert set. Existing ids are left untouched.
pub async fn seed(store: &dyn AlertStore) -> anyhow::Result<usize> {
    let now = Utc::now();
    let alerts = vec![
        ("SEED-001", "TechCorp", "insider_trading", Severity::Critical, 1_250_000.0, "NA", 1),
        ("SEED-002", "TechCorp", "disclosure_breach", Severity::High, 85_000.0, "EU", 3),
        ("SEED-003", "Globex", "wash_trading", Severity::Medium, 12_500.0, "APAC", 2),
        ("SEED-004", "Initech", "price_fixing", Severity::High, 430_000.0, "NA", 6),
        ("SEED-005", "Globex", "reporting_delay", Severity::Low, 900.0, "EU", 11),
        (
            "SEED-006",
            "Umbrella Holdings",
            "market_manipulation",
            Severity::Critical,
            2_100_000.0,
            "LATAM",
            0,
        ),
    ];

    let mut inserted = 0usize;
    for (alert_id, company, violation_type, severity, amount, region, days_ago) in alerts {
        let detected_at = now - Duration::days(days_ago);
        let alert = Alert::new(
            alert_id,
            company,
            violation_type,
            severity,
            amount,
            region,
            detected_at,
        );
        if store
            .insert_alert(&alert)
            .await
            .with_context(|| format!("failed to seed {alert_id}"))?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[derive(serde::Deserialize)]
struct CsvRow {
    alert_id: String,
    company_name: String,
    violation_type: String,
    severity: String,
    amount: f64,
    region: String,
    detected_at: DateTime<Utc>,
}

/// Import alerts from CSV. Rows whose `alert_id` already exists are skipped.
pub async fn import_csv<R: std::io::Read>(
    store: &dyn AlertStore,
    source: R,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_reader(source);
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed CSV row {}", line + 1))?;
        let severity: Severity = row
            .severity
            .parse()
            .map_err(|e: String| anyhow::anyhow!("row {}: {e}", line + 1))?;

        let alert = Alert::new(
            row.alert_id,
            row.company_name,
            row.violation_type,
            severity,
            row.amount,
            row.region,
            row.detected_at,
        );

        if store
            .insert_alert(&alert)
            .await
            .with_context(|| format!("failed to import {}", alert.alert_id))?
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}
