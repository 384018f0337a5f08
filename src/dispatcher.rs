//! Batch processing of alerts.
//!
//! A submitted batch becomes one unit of work per alert id. Units run on
//! spawned tasks, at most `worker_pool_size` at a time, and report into a
//! batch record that callers poll by handle. Units are independent: a failed
//! unit never rolls back or blocks its siblings.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{self, Cache, CacheKey};
use crate::config::DispatcherSettings;
use crate::error::StoreError;
use crate::models::{Alert, CompanyAggregate};
use crate::store::{AggregateStore, AlertStore};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No alert IDs provided")]
    EmptyBatch,
}

/// Attempts and backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per unit, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the `retry`-th re-attempt (1-based): base, 2x base, 4x base...
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Result of a single attempt at a unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Success,
    TransientFailure(String),
    PermanentFailure(String),
    NotFound,
}

impl From<StoreError> for UnitOutcome {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => UnitOutcome::NotFound,
            err if err.is_transient() => UnitOutcome::TransientFailure(err.to_string()),
            other => UnitOutcome::PermanentFailure(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed,
    NotFound,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed | UnitState::NotFound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchHandle(Uuid);

impl BatchHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchHandle {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value).map(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub alert_id: String,
    pub state: UnitState,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: BatchHandle,
    pub state: BatchState,
    pub total: usize,
    pub succeeded: usize,
    pub not_found: usize,
    pub permanently_failed: usize,
    pub retried: usize,
    pub pending: usize,
    pub running: usize,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub units: Vec<UnitReport>,
}

struct BatchRecord {
    submitted_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    units: Vec<UnitReport>,
}

impl BatchRecord {
    fn report(&self, handle: BatchHandle) -> BatchReport {
        let count = |state: UnitState| self.units.iter().filter(|u| u.state == state).count();

        BatchReport {
            batch_id: handle,
            state: if self.completed_at.is_some() {
                BatchState::Completed
            } else {
                BatchState::Running
            },
            total: self.units.len(),
            succeeded: count(UnitState::Succeeded),
            not_found: count(UnitState::NotFound),
            permanently_failed: count(UnitState::Failed),
            retried: self
                .units
                .iter()
                .map(|u| u.attempts.saturating_sub(1) as usize)
                .sum(),
            pending: count(UnitState::Pending),
            running: count(UnitState::Running),
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            units: self.units.clone(),
        }
    }
}

/// Processing rule for one alert: pick it up for review and refresh the
/// company snapshot. Deterministic for a given alert, aggregate and clock.
pub fn apply_processing(
    mut alert: Alert,
    company: Option<&CompanyAggregate>,
    now: DateTime<Utc>,
) -> Alert {
    alert.status = alert.status.advance_for_review();
    alert.total_violations_count = company.map_or(0, |c| c.total_violations);
    alert.company_risk_score = company.map_or(0.0, |c| c.risk_score);
    alert.updated_at = now;
    alert
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    alerts: Arc<dyn AlertStore>,
    aggregates: Arc<dyn AggregateStore>,
    cache: Cache,
    settings: DispatcherSettings,
    workers: Arc<Semaphore>,
    batches: RwLock<HashMap<BatchHandle, BatchRecord>>,
}

impl Dispatcher {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        aggregates: Arc<dyn AggregateStore>,
        cache: Cache,
        settings: DispatcherSettings,
    ) -> Self {
        let pool_size = settings.worker_pool_size.max(1);
        Self {
            inner: Arc::new(Inner {
                alerts,
                aggregates,
                cache,
                settings,
                workers: Arc::new(Semaphore::new(pool_size)),
                batches: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register the batch and start processing it in the background.
    /// Returns once the batch is accepted.
    pub async fn submit_batch(&self, alert_ids: Vec<String>) -> Result<BatchHandle, DispatchError> {
        if alert_ids.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        self.prune_expired().await;

        let handle = BatchHandle::new();
        let units = alert_ids
            .iter()
            .map(|alert_id| UnitReport {
                alert_id: alert_id.clone(),
                state: UnitState::Pending,
                attempts: 0,
                error: None,
            })
            .collect();

        self.inner.batches.write().await.insert(
            handle,
            BatchRecord {
                submitted_at: Utc::now(),
                completed_at: None,
                finished: None,
                units,
            },
        );

        info!("Started batch processing of {} alerts as {handle}", alert_ids.len());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_batch(handle, alert_ids).await;
        });

        Ok(handle)
    }

    /// Current snapshot, or `None` for unknown handles and batches past retention.
    pub async fn batch_report(&self, handle: BatchHandle) -> Option<BatchReport> {
        self.prune_expired().await;
        self.inner
            .batches
            .read()
            .await
            .get(&handle)
            .map(|record| record.report(handle))
    }

    /// Poll until the batch completes.
    #[cfg(test)]
    pub async fn wait_for_completion(
        &self,
        handle: BatchHandle,
        poll_interval: Duration,
    ) -> Option<BatchReport> {
        loop {
            let report = self.batch_report(handle).await?;
            if report.state == BatchState::Completed {
                return Some(report);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn prune_expired(&self) {
        let retention = self.inner.settings.batch_retention;
        let now = Instant::now();
        self.inner.batches.write().await.retain(|handle, record| {
            let keep = record
                .finished
                .map_or(true, |finished| finished + retention > now);
            if !keep {
                debug!("dropping batch {handle} past retention");
            }
            keep
        });
    }
}

impl Inner {
    async fn run_batch(self: Arc<Self>, handle: BatchHandle, alert_ids: Vec<String>) {
        let mut units = JoinSet::new();

        for (index, alert_id) in alert_ids.into_iter().enumerate() {
            let inner = Arc::clone(&self);
            units.spawn(async move {
                let _permit = match Arc::clone(&inner.workers).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        inner
                            .finish_unit(
                                handle,
                                index,
                                UnitOutcome::PermanentFailure("worker pool closed".into()),
                            )
                            .await;
                        return;
                    }
                };
                let outcome = inner.run_unit(handle, index, &alert_id).await;
                inner.finish_unit(handle, index, outcome).await;
            });
        }

        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                error!("Worker for batch {handle} aborted: {e}");
            }
        }

        let mut batches = self.batches.write().await;
        if let Some(record) = batches.get_mut(&handle) {
            for unit in record.units.iter_mut().filter(|u| !u.state.is_terminal()) {
                unit.state = UnitState::Failed;
                unit.error = Some("worker aborted before reporting".to_string());
            }
            record.completed_at = Some(Utc::now());
            record.finished = Some(Instant::now());

            let report = record.report(handle);
            info!(
                "Batch {handle} completed: {} succeeded, {} not found, {} failed, {} retries",
                report.succeeded, report.not_found, report.permanently_failed, report.retried
            );
        }
    }

    /// Drive one unit through its attempts until a terminal outcome.
    async fn run_unit(&self, handle: BatchHandle, index: usize, alert_id: &str) -> UnitOutcome {
        let policy = self.settings.retry;
        let mut attempt: u32 = 1;

        loop {
            self.begin_attempt(handle, index).await;

            match self.attempt(alert_id).await {
                UnitOutcome::TransientFailure(reason) if attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "Error processing alert {alert_id} (attempt {attempt}/{}): {reason}, \
                         retrying in {delay:?}",
                        policy.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                UnitOutcome::TransientFailure(reason) => {
                    return UnitOutcome::PermanentFailure(format!(
                        "gave up after {attempt} attempts: {reason}"
                    ));
                }
                outcome => return outcome,
            }
        }
    }

    async fn attempt(&self, alert_id: &str) -> UnitOutcome {
        let alert = match self.with_timeout(self.alerts.fetch_alert(alert_id)).await {
            Ok(Some(alert)) => alert,
            Ok(None) => return UnitOutcome::NotFound,
            Err(e) => return e.into(),
        };

        let company = match self
            .with_timeout(self.aggregates.fetch_company(&alert.company_name))
            .await
        {
            Ok(company) => company,
            Err(e) => return e.into(),
        };

        let processed = apply_processing(alert, company.as_ref(), Utc::now());
        if let Err(e) = self.with_timeout(self.alerts.save_alert(&processed)).await {
            return e.into();
        }

        self.cache
            .invalidate_endpoints(&[cache::STATISTICS, cache::ALERTS, cache::TOP_COMPANIES])
            .await;
        self.cache
            .invalidate(
                &CacheKey::new(cache::COMPANY)
                    .param("name", &processed.company_name)
                    .to_string(),
            )
            .await;

        UnitOutcome::Success
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let limit = self.settings.store_timeout;
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| StoreError::Transient(format!("store call timed out after {limit:?}")))?
    }

    async fn begin_attempt(&self, handle: BatchHandle, index: usize) {
        let mut batches = self.batches.write().await;
        if let Some(unit) = batches.get_mut(&handle).and_then(|r| r.units.get_mut(index)) {
            unit.state = UnitState::Running;
            unit.attempts += 1;
        }
    }

    async fn finish_unit(&self, handle: BatchHandle, index: usize, outcome: UnitOutcome) {
        let mut batches = self.batches.write().await;
        let Some(unit) = batches.get_mut(&handle).and_then(|r| r.units.get_mut(index)) else {
            return;
        };

        match outcome {
            UnitOutcome::Success => {
                info!("Successfully processed alert {}", unit.alert_id);
                unit.state = UnitState::Succeeded;
                unit.error = None;
            }
            UnitOutcome::NotFound => {
                warn!("Alert {} not found", unit.alert_id);
                unit.state = UnitState::NotFound;
                unit.error = Some("alert not found".to_string());
            }
            UnitOutcome::PermanentFailure(reason) | UnitOutcome::TransientFailure(reason) => {
                error!("Failed to process alert {}: {reason}", unit.alert_id);
                unit.state = UnitState::Failed;
                unit.error = Some(reason);
            }
        }
    }
}
