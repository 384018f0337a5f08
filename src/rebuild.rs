//! Periodic full rebuild of the denormalized company and daily tables.
//!
//! The job is an explicit object with its own lifecycle so it can be run on a
//! schedule, triggered by hand, or awaited directly in tests.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::cache::{self, Cache};
use crate::config::RebuildSettings;
use crate::error::StoreError;
use crate::risk;
use crate::store::{AggregateStore, AlertStore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RebuildError {
    #[error("a rebuild is already running")]
    AlreadyRunning,

    #[error("rebuild aborted: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub companies_rebuilt: usize,
    pub company_failures: usize,
    pub days_rebuilt: usize,
    pub day_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RebuildReport {
    pub fn is_clean(&self) -> bool {
        self.company_failures == 0 && self.day_failures == 0
    }
}

/// Outcome of the last finished run. `Running` is tracked separately.
struct JobStatus {
    state: JobState,
    last_report: Option<RebuildReport>,
}

/// Holds the running flag for one run and releases it on drop, including
/// when the caller abandons the run part way through.
struct RunGuard<'a> {
    running: &'a AtomicBool,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Aggregate rebuild cancelled before completion");
        }
        self.running.store(false, Ordering::Release);
    }
}

pub struct RebuildJob {
    alerts: Arc<dyn AlertStore>,
    aggregates: Arc<dyn AggregateStore>,
    cache: Cache,
    settings: RebuildSettings,
    running: AtomicBool,
    status: Mutex<JobStatus>,
}

impl RebuildJob {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        aggregates: Arc<dyn AggregateStore>,
        cache: Cache,
        settings: RebuildSettings,
    ) -> Self {
        Self {
            alerts,
            aggregates,
            cache,
            settings,
            running: AtomicBool::new(false),
            status: Mutex::new(JobStatus {
                state: JobState::Idle,
                last_report: None,
            }),
        }
    }

    pub async fn state(&self) -> JobState {
        if self.running.load(Ordering::Acquire) {
            return JobState::Running;
        }
        self.status.lock().await.state
    }

    pub async fn last_report(&self) -> Option<RebuildReport> {
        self.status.lock().await.last_report.clone()
    }

    /// Recompute every company aggregate and the trailing daily window.
    /// Failures for one company or day are counted and do not stop the run.
    pub async fn rebuild_all(&self) -> Result<RebuildReport, RebuildError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RebuildError::AlreadyRunning);
        }
        let mut guard = RunGuard {
            running: &self.running,
            finished: false,
        };

        let result = self.run().await;

        {
            let mut status = self.status.lock().await;
            match &result {
                Ok(report) => {
                    status.state = if report.is_clean() {
                        JobState::Idle
                    } else {
                        JobState::Failed
                    };
                    status.last_report = Some(report.clone());
                }
                Err(_) => status.state = JobState::Failed,
            }
        }
        guard.finished = true;

        result
    }

    async fn run(&self) -> Result<RebuildReport, RebuildError> {
        let started_at = Utc::now();
        info!("Starting aggregate rebuild");

        let companies = self.alerts.distinct_companies().await?;
        let mut companies_rebuilt = 0;
        let mut company_failures = 0;

        for company in &companies {
            match self.rebuild_company(company).await {
                Ok(score) => {
                    companies_rebuilt += 1;
                    info!("Updated risk score for {company}: {score:.2}");
                }
                Err(e) => {
                    company_failures += 1;
                    error!("Error calculating risk for {company}: {e}");
                }
            }
        }

        let (days_rebuilt, day_failures) = self.rebuild_daily_window().await;

        self.cache
            .invalidate_endpoints(&[cache::TOP_COMPANIES, cache::TRENDS, cache::COMPANY])
            .await;

        let report = RebuildReport {
            companies_rebuilt,
            company_failures,
            days_rebuilt,
            day_failures,
            started_at,
            finished_at: Utc::now(),
        };

        if report.is_clean() {
            info!(
                "Aggregate rebuild finished: {} companies, {} days",
                report.companies_rebuilt, report.days_rebuilt
            );
        } else {
            warn!(
                "Aggregate rebuild finished with {} company and {} day failures",
                report.company_failures, report.day_failures
            );
        }

        Ok(report)
    }

    async fn rebuild_company(&self, company: &str) -> Result<f64, StoreError> {
        let alerts = self.alerts.alerts_for_company(company).await?;
        let aggregate = risk::aggregate_company(company, &alerts);
        self.aggregates.replace_company(&aggregate).await?;
        Ok(aggregate.risk_score)
    }

    async fn rebuild_daily_window(&self) -> (usize, usize) {
        let end = Utc::now().date_naive();
        let start = risk::cutoff_date(self.settings.trend_window_days);
        let window_len = (end - start).num_days() as usize + 1;

        let since = start.and_time(NaiveTime::MIN).and_utc();
        let alerts = match self.alerts.alerts_since(since).await {
            Ok(alerts) => alerts,
            Err(e) => {
                error!("Failed to load alerts for daily statistics since {start}: {e}");
                return (0, window_len);
            }
        };

        let mut rebuilt = 0;
        let mut failures = 0;
        for stat in risk::daily_statistics(&alerts, start, end) {
            match self.aggregates.upsert_daily(&stat).await {
                Ok(()) => rebuilt += 1,
                Err(e) => {
                    failures += 1;
                    error!("Failed to store statistics for {}: {e}", stat.date);
                }
            }
        }

        (rebuilt, failures)
    }

    /// Run `rebuild_all` every `interval`, starting immediately, until
    /// `shutdown` resolves.
    pub async fn run_scheduled<S>(&self, interval: Duration, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        info!("Starting rebuild scheduler (interval: {}s)", interval.as_secs());

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Rebuild scheduler shutting down");
                    break;
                }
                _ = timer.tick() => {
                    match self.rebuild_all().await {
                        Ok(_) => {}
                        Err(RebuildError::AlreadyRunning) => {
                            warn!("Skipping scheduled rebuild, previous run still active");
                        }
                        Err(e) => error!("Scheduled rebuild failed: {e}"),
                    }
                }
            }
        }
    }
}
