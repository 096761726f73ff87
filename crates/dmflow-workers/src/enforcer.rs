//! Subscription enforcer.
//!
//! Daily pass that demotes expired paid subscriptions to the free plan
//! and switches off the account's newest active flows above the free
//! plan's allowance. Each account is handled in its own transaction, so
//! one failure never rolls back another account's demotion.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dmflow_core::config::WorkersConfig;
use dmflow_store::SqliteStore;

/// Counters from one enforcement pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnforcerSummary {
    pub demoted: usize,
    pub flows_deactivated: usize,
    pub failures: usize,
}

pub struct SubscriptionEnforcer {
    store: Arc<SqliteStore>,
    workers: WorkersConfig,
    cancel: CancellationToken,
}

impl SubscriptionEnforcer {
    pub fn new(store: Arc<SqliteStore>, workers: WorkersConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            workers,
            cancel,
        }
    }

    /// Run the enforcement loop. Blocks until cancelled.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.workers.enforcer_interval_secs);
        info!(
            interval_secs = self.workers.enforcer_interval_secs,
            "Subscription enforcer started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.cancel.cancelled() => {
                    info!("Subscription enforcer shutting down");
                    break;
                }
            }

            let summary = self.run_once();
            info!(
                demoted = summary.demoted,
                flows_deactivated = summary.flows_deactivated,
                failures = summary.failures,
                "Enforcement pass finished"
            );
        }
    }

    /// One enforcement pass. Storage errors are logged, never propagated
    /// to the scheduler.
    pub fn run_once(&self) -> EnforcerSummary {
        let mut summary = EnforcerSummary::default();

        let expired = match self.store.expired_subscriptions(Utc::now()) {
            Ok(expired) => expired,
            Err(e) => {
                error!("Failed to read expired subscriptions: {}", e);
                return summary;
            }
        };
        if expired.is_empty() {
            return summary;
        }

        let free = match self.store.free_plan() {
            Ok(Some(free)) => free,
            Ok(None) => {
                warn!("No active free plan configured, skipping enforcement");
                return summary;
            }
            Err(e) => {
                error!("Failed to load free plan: {}", e);
                return summary;
            }
        };

        for subscription in expired {
            match self.store.demote_subscription(&subscription, &free) {
                Ok(deactivated) => {
                    info!(
                        account = %subscription.account,
                        plan = %subscription.plan.name,
                        deactivated,
                        "Expired subscription demoted to free plan"
                    );
                    summary.demoted += 1;
                    summary.flows_deactivated += deactivated;
                }
                Err(e) => {
                    error!(
                        account = %subscription.account,
                        "Demotion failed, account left untouched: {}",
                        e
                    );
                    summary.failures += 1;
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use dmflow_core::types::TriggerPredicate;
    use dmflow_test_utils::store_with_account;

    #[test]
    fn expired_paid_account_is_demoted_once() {
        let (store, account) = store_with_account();
        let store = Arc::new(store);

        for title in ["First", "Second", "Third"] {
            store
                .create_flow(account, title, &TriggerPredicate::default())
                .unwrap();
        }
        let paid = store.create_plan("Pro", "paid", Some(500), 10).unwrap();
        store.create_plan("Free", "free", None, 1).unwrap();
        store
            .create_subscription(
                account,
                paid,
                "active",
                Some(Utc::now() - ChronoDuration::days(2)),
            )
            .unwrap();

        let enforcer = SubscriptionEnforcer::new(
            store.clone(),
            WorkersConfig::default(),
            CancellationToken::new(),
        );

        let summary = enforcer.run_once();
        assert_eq!(summary.demoted, 1);
        assert_eq!(summary.flows_deactivated, 2);
        assert_eq!(summary.failures, 0);

        // Second pass finds nothing left to do.
        let again = enforcer.run_once();
        assert_eq!(again, EnforcerSummary::default());
    }

    #[test]
    fn missing_free_plan_is_a_noop() {
        let (store, account) = store_with_account();
        let store = Arc::new(store);
        let paid = store.create_plan("Pro", "paid", Some(500), 10).unwrap();
        store
            .create_subscription(
                account,
                paid,
                "active",
                Some(Utc::now() - ChronoDuration::days(2)),
            )
            .unwrap();

        let enforcer = SubscriptionEnforcer::new(
            store.clone(),
            WorkersConfig::default(),
            CancellationToken::new(),
        );
        assert_eq!(enforcer.run_once(), EnforcerSummary::default());
    }
}
