//! Callers of the Step Executor: a self-chaining driver and a recovery
//! sweep for runs whose chain was interrupted.
//!
//! The driver invokes `execute_step` until the run reports no more work,
//! bounding each invocation with a timeout and retrying transient failures
//! with capped exponential backoff. When retries run out the run is simply
//! left where it is; the sweep picks up any pending or running run whose
//! `updated_at` has gone stale and drives it again.

use crate::config::RunnerConfig;
use crate::error::{HypoforgeError, PipelineError, StoreError};
use crate::executor::{StepExecutor, is_transient};
use crate::phase::Phase;
use crate::store::PipelineStore;
use crate::types::{Run, RunId, RunStatus, StepOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay before retry number `attempt` (zero-based): `initial * 2^attempt`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// A run that should be making progress but has not been touched within
/// `threshold`.
pub fn is_stale(run: &Run, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
    matches!(run.status, RunStatus::Pending | RunStatus::Running)
        && now.signed_duration_since(run.updated_at) > threshold
}

/// What one `drive` call did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveReport {
    pub run_id: RunId,
    /// Successful step invocations.
    pub steps: usize,
    pub last_phase: Option<Phase>,
    /// The executor reported no more work.
    pub finished: bool,
    /// Transient failures outlasted the retry budget.
    pub abandoned: bool,
    /// Another drive of the same run was already in progress.
    pub already_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DriveReport {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            steps: 0,
            last_phase: None,
            finished: false,
            abandoned: false,
            already_active: false,
            error: None,
        }
    }
}

/// Removes the run from the active set when the drive ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<RunId>>,
    run_id: RunId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}

/// Chains step invocations for one run at a time per run id.
pub struct RunDriver {
    executor: Arc<StepExecutor>,
    settings: RunnerConfig,
    active: Mutex<HashSet<RunId>>,
}

impl RunDriver {
    pub fn new(executor: Arc<StepExecutor>, settings: RunnerConfig) -> Self {
        Self {
            executor,
            settings,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> &RunnerConfig {
        &self.settings
    }

    fn claim(&self, run_id: RunId) -> Option<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        active.insert(run_id).then(|| ActiveGuard {
            active: &self.active,
            run_id,
        })
    }

    /// One executor invocation bounded by `step_timeout_secs`.
    pub async fn step_once(&self, run_id: RunId) -> Result<StepOutcome, HypoforgeError> {
        let timeout = self.settings.step_timeout();
        match tokio::time::timeout(timeout, self.executor.execute_step(run_id)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::StepTimeout {
                timeout_secs: timeout.as_secs(),
            }
            .into()),
        }
    }

    /// One invocation, retried with backoff while it fails transiently.
    pub async fn step_with_retry(&self, run_id: RunId) -> Result<StepOutcome, HypoforgeError> {
        let initial = Duration::from_millis(self.settings.initial_backoff_ms);
        let max = Duration::from_millis(self.settings.max_backoff_ms);
        let mut attempt = 0;
        loop {
            match self.step_once(run_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if retryable(&e) && attempt < self.settings.max_chain_retries => {
                    let delay = backoff_delay(attempt, initial, max);
                    warn!(
                        run_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Invoke the executor repeatedly until the run has no more work.
    pub async fn drive(&self, run_id: RunId) -> DriveReport {
        let mut report = DriveReport::new(run_id);
        let Some(_guard) = self.claim(run_id) else {
            debug!(run_id, "Run is already being driven");
            report.already_active = true;
            return report;
        };

        let poll_delay = Duration::from_millis(self.settings.poll_delay_ms);
        loop {
            if report.steps >= self.settings.max_steps_per_drive {
                warn!(run_id, steps = report.steps, "Step limit reached, leaving run for the sweep");
                break;
            }
            match self.step_with_retry(run_id).await {
                Ok(outcome) => {
                    if outcome.phase.is_some() {
                        report.steps += 1;
                        report.last_phase = outcome.phase;
                    }
                    if !outcome.has_more {
                        report.finished = true;
                        report.error = outcome.error;
                        break;
                    }
                    if !poll_delay.is_zero()
                        && matches!(
                            outcome.phase,
                            Some(Phase::Step2_1Polling | Phase::Step2_2Polling)
                        )
                    {
                        tokio::time::sleep(poll_delay).await;
                    }
                }
                Err(e) => {
                    error!(run_id, error = %e, "Giving up on run until the next recovery sweep");
                    report.abandoned = true;
                    report.error = Some(e.to_string());
                    break;
                }
            }
        }

        info!(
            run_id,
            steps = report.steps,
            finished = report.finished,
            abandoned = report.abandoned,
            "Drive ended"
        );
        report
    }
}

fn retryable(err: &HypoforgeError) -> bool {
    matches!(
        err,
        HypoforgeError::Pipeline(PipelineError::StepTimeout { .. })
    ) || is_transient(err)
}

/// Finds stale runs and drives them again.
pub struct RecoverySweep {
    store: Arc<dyn PipelineStore>,
    driver: Arc<RunDriver>,
    threshold: chrono::Duration,
}

impl RecoverySweep {
    pub fn new(store: Arc<dyn PipelineStore>, driver: Arc<RunDriver>) -> Self {
        let threshold = driver.settings().stale_threshold();
        Self {
            store,
            driver,
            threshold,
        }
    }

    pub async fn find_stale(&self, now: DateTime<Utc>) -> Result<Vec<RunId>, StoreError> {
        Ok(self
            .store
            .list_runs()
            .await?
            .iter()
            .filter(|run| is_stale(run, now, self.threshold))
            .map(|run| run.id)
            .collect())
    }

    /// Drive every stale run concurrently.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<Vec<DriveReport>, StoreError> {
        let stale = self.find_stale(now).await?;
        if stale.is_empty() {
            debug!("No stale runs");
            return Ok(Vec::new());
        }
        info!(count = stale.len(), runs = ?stale, "Resuming stale runs");
        let drives = stale.iter().map(|&run_id| self.driver.drive(run_id));
        Ok(futures::future::join_all(drives).await)
    }

    /// Sweep every `interval` until the task is dropped.
    pub async fn run_forever(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sweep_once(Utc::now()).await {
                error!(error = %e, "Recovery sweep failed");
            }
        }
    }
}
