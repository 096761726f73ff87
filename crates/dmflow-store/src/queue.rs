//! Trigger queue, API call ledger, and subscription/plan queries.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::types::*;

use crate::store::{db_err, parse_ts, ts, SqliteStore};

/// Row from the plans table.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub plan_type: String,
    pub message_rate_limit: Option<u32>,
    pub max_active_flows: u32,
}

/// Subscription joined with its plan, as the enforcer sees it.
#[derive(Debug, Clone)]
pub struct AccountSubscription {
    pub id: i64,
    pub account: AccountId,
    pub plan: Plan,
    pub status: String,
    pub end_date: Option<DateTime<Utc>>,
}

impl SqliteStore {
    // =====================================================================
    // Trigger queue
    // =====================================================================

    pub fn enqueue_trigger(
        &self,
        account: AccountId,
        flow: FlowId,
        comment: &CommentEvent,
    ) -> Result<TriggerId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO triggers (account_id, flow_id, status, comment, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
            params![
                account.0,
                flow.0,
                serde_json::to_string(comment)?,
                ts(Utc::now()),
            ],
        )
        .map_err(db_err)?;
        Ok(TriggerId(conn.last_insert_rowid()))
    }

    pub fn load_trigger(&self, id: TriggerId) -> Result<QueuedTrigger> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, account_id, flow_id, status, comment, created_at, processed_at
             FROM triggers WHERE id = ?1",
            params![id.0],
            |row| {
                let status: String = row.get(3)?;
                let comment: String = row.get(4)?;
                let created: String = row.get(5)?;
                let processed: Option<String> = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    status,
                    comment,
                    created,
                    processed,
                ))
            },
        )
        .optional()
        .map_err(db_err)?
        .map(|(id, account, flow, status, comment, created, processed)| -> Result<QueuedTrigger> {
            Ok(QueuedTrigger {
                id: TriggerId(id),
                account: AccountId(account),
                flow: FlowId(flow),
                status: TriggerStatus::parse(&status).unwrap_or(TriggerStatus::Failed),
                comment: serde_json::from_str(&comment)?,
                created_at: parse_ts(&created),
                processed_at: processed.as_deref().map(parse_ts),
            })
        })
        .transpose()?
        .ok_or(DmFlowError::TriggerNotFound(id.0))
    }

    /// Atomically move a pending trigger to `processing`. Returns `false`
    /// when the trigger was already claimed, so a retried delivery becomes
    /// a no-op.
    pub fn claim_trigger(&self, id: TriggerId) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE triggers SET status = 'processing'
                 WHERE id = ?1 AND status = 'pending'",
                params![id.0],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    pub fn finish_trigger(&self, id: TriggerId, status: TriggerStatus) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE triggers SET status = ?1, processed_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts(Utc::now()), id.0],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Pending trigger ids created after `cutoff`, oldest first, grouped by
    /// nothing: callers bucket per account themselves.
    pub fn pending_triggers_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<QueuedTrigger>> {
        let ids: Vec<i64> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM triggers
                     WHERE status = 'pending' AND created_at >= ?1
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![ts(cutoff)], |row| row.get(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        ids.into_iter().map(|id| self.load_trigger(TriggerId(id))).collect()
    }

    /// Mark pending triggers older than `cutoff` as failed. Returns how
    /// many were abandoned.
    pub fn abandon_stale_triggers(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE triggers SET status = 'failed', processed_at = ?1
                 WHERE status = 'pending' AND created_at < ?2",
                params![ts(Utc::now()), ts(cutoff)],
            )
            .map_err(db_err)?;
        if changed > 0 {
            info!(count = changed, "Abandoned stale triggers");
        }
        Ok(changed)
    }

    // =====================================================================
    // API call ledger
    // =====================================================================

    pub fn record_api_call(&self, account: AccountId, call_type: &str, success: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO api_call_log (account_id, call_type, success, sent_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account.0, call_type, success, ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Successful outbound calls in the trailing hour.
    pub fn calls_last_hour(&self, account: AccountId) -> Result<u32> {
        let conn = self.lock()?;
        let cutoff = ts(Utc::now() - Duration::hours(1));
        conn.query_row(
            "SELECT COUNT(*) FROM api_call_log
             WHERE account_id = ?1 AND success = 1 AND sent_at >= ?2",
            params![account.0, cutoff],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    // =====================================================================
    // Plans and subscriptions
    // =====================================================================

    pub fn create_plan(
        &self,
        name: &str,
        plan_type: &str,
        message_rate_limit: Option<u32>,
        max_active_flows: u32,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO plans (name, plan_type, message_rate_limit, max_active_flows)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, plan_type, message_rate_limit, max_active_flows],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn create_subscription(
        &self,
        account: AccountId,
        plan_id: i64,
        status: &str,
        end_date: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO subscriptions (account_id, plan_id, status, end_date, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account.0,
                plan_id,
                status,
                end_date.map(ts),
                ts(Utc::now()),
            ],
        )
        .map_err(db_err)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_config_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn config_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM config WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Per-hour message budget for an account. Resolution order: the
    /// account's active subscription plan limit, then the
    /// `default_message_rate_limit` config row, then `fallback`.
    pub fn rate_limit_for(&self, account: AccountId, fallback: u32) -> Result<u32> {
        let plan_limit: Option<Option<u32>> = {
            let conn = self.lock()?;
            conn.query_row(
                "SELECT p.message_rate_limit FROM subscriptions s
                 JOIN plans p ON p.id = s.plan_id
                 WHERE s.account_id = ?1 AND s.status = 'active'
                 ORDER BY s.updated_at DESC LIMIT 1",
                params![account.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
        };

        if let Some(Some(limit)) = plan_limit {
            return Ok(limit);
        }
        if let Some(raw) = self.config_value("default_message_rate_limit")? {
            if let Ok(limit) = raw.trim().parse() {
                return Ok(limit);
            }
        }
        Ok(fallback)
    }

    /// Active subscriptions whose end date has passed.
    pub fn expired_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<AccountSubscription>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.account_id, s.status, s.end_date,
                        p.id, p.name, p.plan_type, p.message_rate_limit, p.max_active_flows
                 FROM subscriptions s JOIN plans p ON p.id = s.plan_id
                 WHERE s.status = 'active' AND s.end_date IS NOT NULL AND s.end_date < ?1",
                )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(now)], |row| {
                let end: Option<String> = row.get(3)?;
                Ok(AccountSubscription {
                    id: row.get(0)?,
                    account: AccountId(row.get(1)?),
                    status: row.get(2)?,
                    end_date: end.as_deref().map(parse_ts),
                    plan: Plan {
                        id: row.get(4)?,
                        name: row.get(5)?,
                        plan_type: row.get(6)?,
                        message_rate_limit: row.get(7)?,
                        max_active_flows: row.get(8)?,
                    },
                })
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// The active free plan, if one is configured.
    pub fn free_plan(&self) -> Result<Option<Plan>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, plan_type, message_rate_limit, max_active_flows
             FROM plans WHERE plan_type = 'free' AND active = 1
             ORDER BY id LIMIT 1",
            [],
            |row| {
                Ok(Plan {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    plan_type: row.get(2)?,
                    message_rate_limit: row.get(3)?,
                    max_active_flows: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Demote one expired subscription to the free plan and deactivate the
    /// account's newest flows above the free plan's cap, all in one
    /// transaction. Returns the number of flows deactivated.
    pub fn demote_subscription(
        &self,
        subscription: &AccountSubscription,
        free: &Plan,
    ) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let now = ts(Utc::now());

        tx.execute(
            "UPDATE subscriptions SET plan_id = ?1, status = 'expired_downgraded', updated_at = ?2
             WHERE id = ?3",
            params![free.id, now, subscription.id],
        )
        .map_err(db_err)?;

        // Oldest flows survive; everything past the cap is switched off.
        let excess: Vec<i64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM flows
                     WHERE account_id = ?1 AND active = 1
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(db_err)?;
            let all: Vec<i64> = stmt
                .query_map(params![subscription.account.0], |row| row.get(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            all.into_iter().skip(free.max_active_flows as usize).collect()
        };

        for flow_id in &excess {
            tx.execute(
                "UPDATE flows SET active = 0, deactivated_by = 'subscription_enforcer'
                 WHERE id = ?1",
                params![flow_id],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(excess.len())
    }
}
