//! Polls the durable action store, claims due work and hands it to an
//! executor.
//!
//! Several scheduler processes may share one store: the atomic claim is the
//! only coordination between them. A claimed action that is never finished
//! (crash, retryable failure) stays `processing` until stale recovery returns
//! it to `pending`, so execution is at-least-once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use pacer_core::config::SchedulerConfig;
use pacer_core::domain::action::ScheduledAction;
use pacer_db::repositories::{RepositoryError, ScheduledActionStore};

pub const MAX_ATTEMPTS_EXCEEDED: &str = "max_attempts_exceeded";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Leave the action in processing; stale recovery will offer it again.
    #[error("retryable execution failure: {0}")]
    Retryable(String),
    /// Cancel the action with this reason.
    #[error("permanent execution failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &ScheduledAction) -> Result<(), ExecutionFailure>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl BackoffPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub preemptive_window: chrono::Duration,
    pub stale_after: chrono::Duration,
    pub max_attempts: u32,
    pub stale_sweep_every: u64,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_seconds.max(1)),
            batch_size: config.batch_size.max(1),
            preemptive_window: seconds(config.preemptive_window_seconds),
            stale_after: seconds(config.stale_after_seconds),
            max_attempts: config.max_attempts.max(1),
            stale_sweep_every: u64::from(config.stale_sweep_every.max(1)),
            backoff: BackoffPolicy {
                base_delay_ms: config.base_backoff_ms,
                max_delay_ms: config.max_backoff_ms,
            },
        }
    }
}

const MAX_CONFIGURED_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_CONFIGURED_SECS) as i64)
}

/// Outcome counters of a single poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    pub recovered: usize,
    pub claimed: usize,
    pub executed: usize,
    pub cancelled: usize,
    pub retry_later: usize,
    /// Finished actions whose status had already been changed elsewhere.
    pub lost_race: usize,
    pub store_errors: usize,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.claimed == 0
    }
}

pub struct PollingScheduler {
    store: Arc<dyn ScheduledActionStore>,
    executor: Arc<dyn ActionExecutor>,
    settings: SchedulerSettings,
    polls: AtomicU64,
}

impl PollingScheduler {
    pub fn new(
        store: Arc<dyn ScheduledActionStore>,
        executor: Arc<dyn ActionExecutor>,
        settings: SchedulerSettings,
    ) -> Self {
        Self { store, executor, settings, polls: AtomicU64::new(0) }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped. Store
    /// failures are retried with backoff; nothing here ends the loop early.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            event_name = "scheduler.started",
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "scheduler loop started"
        );

        let mut attempt = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.recover_stale(Utc::now()).await {
                Ok(_) => break,
                Err(store_error) => {
                    let delay = self.settings.backoff.backoff(attempt);
                    warn!(
                        event_name = "scheduler.startup_recovery_failed",
                        attempt,
                        error = %store_error,
                        retry_in_ms = delay.as_millis() as u64,
                        "stale recovery failed at startup"
                    );
                    attempt = attempt.saturating_add(1);
                    if wait_or_shutdown(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }

        let mut consecutive_failures = 0_u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once(Utc::now()).await {
                Ok(report) => {
                    consecutive_failures = 0;
                    if !report.is_idle() {
                        info!(
                            event_name = "scheduler.poll_completed",
                            recovered = report.recovered,
                            claimed = report.claimed,
                            executed = report.executed,
                            cancelled = report.cancelled,
                            retry_later = report.retry_later,
                            lost_race = report.lost_race,
                            "scheduler poll completed"
                        );
                    }
                    self.settings.poll_interval
                }
                Err(store_error) => {
                    let delay = self.settings.backoff.backoff(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        event_name = "scheduler.poll_failed",
                        consecutive_failures,
                        error = %store_error,
                        retry_in_ms = delay.as_millis() as u64,
                        "scheduler poll failed; backing off"
                    );
                    delay
                }
            };

            if wait_or_shutdown(wait, &mut shutdown).await {
                break;
            }
        }

        info!(event_name = "scheduler.stopped", "scheduler loop stopped");
    }

    /// One poll: periodic stale sweep, claim, execute, settle. Only errors
    /// from the sweep or the claim are returned.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollReport, RepositoryError> {
        let mut report = PollReport::default();

        let poll_number = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        if poll_number % self.settings.stale_sweep_every == 0 {
            report.recovered = self.recover_stale(now).await?;
        }

        let due_by = now + self.settings.preemptive_window;
        let claimed = self.store.claim_due(self.settings.batch_size, due_by, now).await?;
        report.claimed = claimed.len();

        for action in claimed {
            self.execute_one(&action, &mut report).await;
        }

        Ok(report)
    }

    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let recovered = self.store.reset_stale_processing(self.settings.stale_after, now).await?;
        for id in &recovered {
            warn!(
                event_name = "scheduler.action.stale_recovered",
                action_id = %id,
                stale_after_secs = self.settings.stale_after.num_seconds(),
                "stale processing action returned to pending"
            );
        }
        Ok(recovered.len())
    }

    async fn execute_one(&self, action: &ScheduledAction, report: &mut PollReport) {
        debug!(
            event_name = "scheduler.action.claimed",
            action_id = %action.id,
            conversation_id = %action.conversation_id,
            action_type = action.action_type.as_str(),
            attempts = action.attempts,
            "executing claimed action"
        );

        match self.executor.execute(action).await {
            Ok(()) => match self.store.mark_executed(&action.id, Utc::now()).await {
                Ok(true) => {
                    report.executed += 1;
                    info!(
                        event_name = "scheduler.action.executed",
                        action_id = %action.id,
                        conversation_id = %action.conversation_id,
                        action_type = action.action_type.as_str(),
                        "scheduled action executed"
                    );
                }
                Ok(false) => {
                    report.lost_race += 1;
                    warn!(
                        event_name = "scheduler.action.lost_race",
                        action_id = %action.id,
                        conversation_id = %action.conversation_id,
                        "action finished but its status had already changed"
                    );
                }
                Err(store_error) => self.record_store_error(action, &store_error, report),
            },
            Err(ExecutionFailure::Retryable(reason)) => {
                if action.attempts >= self.settings.max_attempts {
                    warn!(
                        event_name = "scheduler.action.attempts_exhausted",
                        action_id = %action.id,
                        conversation_id = %action.conversation_id,
                        attempts = action.attempts,
                        reason = %reason,
                        "retryable failure after the final attempt; cancelling"
                    );
                    self.cancel(action, MAX_ATTEMPTS_EXCEEDED, report).await;
                } else {
                    report.retry_later += 1;
                    warn!(
                        event_name = "scheduler.action.retry_later",
                        action_id = %action.id,
                        conversation_id = %action.conversation_id,
                        attempts = action.attempts,
                        reason = %reason,
                        "retryable failure; left for stale recovery"
                    );
                }
            }
            Err(ExecutionFailure::Permanent(reason)) => {
                info!(
                    event_name = "scheduler.action.permanent_failure",
                    action_id = %action.id,
                    conversation_id = %action.conversation_id,
                    reason = %reason,
                    "permanent failure; cancelling"
                );
                self.cancel(action, &reason, report).await;
            }
        }
    }

    async fn cancel(&self, action: &ScheduledAction, reason: &str, report: &mut PollReport) {
        match self.store.mark_cancelled(&action.id, reason, Utc::now()).await {
            Ok(true) => report.cancelled += 1,
            Ok(false) => {
                report.lost_race += 1;
                warn!(
                    event_name = "scheduler.action.lost_race",
                    action_id = %action.id,
                    "cancel skipped; action already reached a terminal status"
                );
            }
            Err(store_error) => self.record_store_error(action, &store_error, report),
        }
    }

    fn record_store_error(
        &self,
        action: &ScheduledAction,
        store_error: &RepositoryError,
        report: &mut PollReport,
    ) {
        report.store_errors += 1;
        error!(
            event_name = "scheduler.action.settle_failed",
            action_id = %action.id,
            conversation_id = %action.conversation_id,
            error = %store_error,
            "could not record action outcome; stale recovery will retry it"
        );
    }
}

/// Returns `true` when shutdown was requested while waiting.
async fn wait_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
