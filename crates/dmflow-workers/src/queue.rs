//! Rate-budgeted trigger queue worker.
//!
//! Runs on a fixed interval. Each pass abandons triggers older than 24
//! hours, groups the remaining backlog per account, converts the
//! account's remaining hourly rate budget into a trigger quota, and
//! replays eligible triggers through the engine's entry point. Triggers
//! over quota stay pending for the next pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dmflow_core::config::{RateLimitConfig, WorkersConfig};
use dmflow_core::types::{AccountId, QueuedTrigger, TriggerStatus};
use dmflow_engine::{EngineProvider, TriggerOutcome};
use dmflow_store::SqliteStore;

/// Pending triggers older than this are abandoned, not retried.
const MAX_TRIGGER_AGE_HOURS: i64 = 24;
/// Stop dispatching once less than this much wall clock remains, so a
/// pass never dies mid-call.
const STOP_MARGIN_SECS: u64 = 30;

/// Counters from one queue pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRunSummary {
    pub processed: usize,
    pub failed: usize,
    /// Left pending: over quota or out of wall clock.
    pub skipped: usize,
    pub abandoned: usize,
}

pub struct QueueWorker {
    store: Arc<SqliteStore>,
    engines: Arc<dyn EngineProvider>,
    workers: WorkersConfig,
    limits: RateLimitConfig,
    cancel: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        engines: Arc<dyn EngineProvider>,
        workers: WorkersConfig,
        limits: RateLimitConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            engines,
            workers,
            limits,
            cancel,
        }
    }

    /// Run the worker loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.workers.queue_interval_secs);
        info!(
            interval_secs = self.workers.queue_interval_secs,
            "Trigger queue worker started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Trigger queue worker shutting down");
                    break;
                }
            }

            let summary = self.run_once().await;
            info!(
                processed = summary.processed,
                failed = summary.failed,
                skipped = summary.skipped,
                abandoned = summary.abandoned,
                "Queue pass finished"
            );
        }
    }

    /// One queue pass. Storage errors are logged and swallowed so the
    /// scheduler never retries a partially-completed batch.
    pub async fn run_once(&self) -> QueueRunSummary {
        let started = Instant::now();
        let run_budget = Duration::from_secs(self.workers.run_budget_secs);
        let mut summary = QueueRunSummary::default();

        let cutoff = Utc::now() - chrono::Duration::hours(MAX_TRIGGER_AGE_HOURS);
        match self.store.abandon_stale_triggers(cutoff) {
            Ok(count) => summary.abandoned = count,
            Err(e) => {
                error!("Failed to abandon stale triggers: {}", e);
                return summary;
            }
        }

        let pending = match self.store.pending_triggers_since(cutoff) {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to read pending triggers: {}", e);
                return summary;
            }
        };
        if pending.is_empty() {
            return summary;
        }

        let mut by_account: BTreeMap<AccountId, Vec<QueuedTrigger>> = BTreeMap::new();
        for trigger in pending {
            by_account.entry(trigger.account).or_default().push(trigger);
        }

        'accounts: for (account, triggers) in by_account {
            let quota = match self.trigger_quota(account) {
                Ok(quota) => quota,
                Err(e) => {
                    error!(account = %account, "Budget computation failed: {}", e);
                    summary.skipped += triggers.len();
                    continue;
                }
            };
            let engine = match self.engines.engine_for(account) {
                Ok(engine) => engine,
                Err(e) => {
                    error!(account = %account, "Engine setup failed: {}", e);
                    summary.skipped += triggers.len();
                    continue;
                }
            };
            info!(
                account = %account,
                backlog = triggers.len(),
                quota,
                "Processing account backlog"
            );

            for (index, trigger) in triggers.iter().enumerate() {
                if index >= quota {
                    summary.skipped += triggers.len() - index;
                    break;
                }
                let remaining = run_budget.saturating_sub(started.elapsed());
                if remaining < Duration::from_secs(STOP_MARGIN_SECS) {
                    warn!(
                        remaining_secs = remaining.as_secs(),
                        "Wall clock nearly exhausted, leaving rest of backlog pending"
                    );
                    summary.skipped += triggers.len() - index;
                    break 'accounts;
                }

                match engine.process_trigger(trigger.id).await {
                    Ok(TriggerOutcome::Processed { status, .. })
                        if !matches!(status, dmflow_core::types::SessionStatus::Error) =>
                    {
                        summary.processed += 1;
                    }
                    Ok(TriggerOutcome::Processed { .. }) | Ok(TriggerOutcome::FlowInactive) => {
                        summary.failed += 1;
                    }
                    Ok(TriggerOutcome::AlreadyHandled) => {}
                    Err(e) => {
                        // No retry within this run; flag the trigger so it
                        // is not replayed endlessly.
                        error!(trigger = %trigger.id, "Trigger dispatch failed: {}", e);
                        if let Err(e) = self.store.finish_trigger(trigger.id, TriggerStatus::Failed)
                        {
                            error!(trigger = %trigger.id, "Failed to mark trigger failed: {}", e);
                        }
                        summary.failed += 1;
                    }
                }
            }
        }

        summary
    }

    /// `max(0, (planLimit - callsInTrailingHour - safetyBuffer) / perTriggerCost)`
    fn trigger_quota(&self, account: AccountId) -> dmflow_core::error::Result<usize> {
        let limit = self
            .store
            .rate_limit_for(account, self.limits.default_per_hour)?;
        let used = self.store.calls_last_hour(account)?;
        let budget =
            i64::from(limit) - i64::from(used) - i64::from(self.limits.safety_buffer);
        let quota = (budget / i64::from(self.limits.per_trigger_cost.max(1))).max(0);
        Ok(quota as usize)
    }
}
