use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        platform_user_id TEXT NOT NULL,
        access_token TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS plans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        plan_type TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        message_rate_limit INTEGER,
        max_active_flows INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS subscriptions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        plan_id INTEGER NOT NULL REFERENCES plans(id),
        status TEXT NOT NULL,
        end_date TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS flows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        title TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        trigger_post_id TEXT,
        trigger_keywords TEXT NOT NULL DEFAULT '[]',
        deactivated_by TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL REFERENCES flows(id),
        ord INTEGER NOT NULL,
        next_node INTEGER,
        config TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_nodes_flow ON nodes(flow_id, ord);

    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_id INTEGER NOT NULL REFERENCES flows(id),
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        igsid TEXT NOT NULL,
        username TEXT NOT NULL,
        trigger_comment_id TEXT,
        trigger_post_id TEXT,
        trigger_comment_text TEXT,
        current_node INTEGER,
        status TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT '{}',
        variables TEXT NOT NULL DEFAULT '{}',
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_user
        ON sessions(account_id, igsid, status);

    CREATE TABLE IF NOT EXISTS execution_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id),
        node_id INTEGER,
        action TEXT NOT NULL,
        details TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_log_session
        ON execution_log(session_id, action, created_at);

    CREATE TABLE IF NOT EXISTS leads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        igsid TEXT NOT NULL,
        username TEXT NOT NULL,
        name TEXT,
        email TEXT,
        phone TEXT,
        custom TEXT NOT NULL DEFAULT '{}',
        is_follower INTEGER,
        updated_at TEXT NOT NULL,
        UNIQUE(account_id, igsid)
    );

    CREATE TABLE IF NOT EXISTS triggers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        flow_id INTEGER NOT NULL REFERENCES flows(id),
        status TEXT NOT NULL DEFAULT 'pending',
        comment TEXT NOT NULL,
        created_at TEXT NOT NULL,
        processed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_triggers_status ON triggers(status, created_at);

    CREATE TABLE IF NOT EXISTS api_call_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        call_type TEXT NOT NULL,
        success INTEGER NOT NULL,
        sent_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_api_calls
        ON api_call_log(account_id, sent_at, success);
";

/// SQLite-backed storage shared by the engine, the webhook server, and the
/// queue workers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

/// RFC3339 with fixed microsecond precision so stored timestamps compare
/// lexicographically.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn db_err(e: impl std::fmt::Display) -> DmFlowError {
    DmFlowError::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DmFlowError::Database(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent webhook deliveries
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| db_err(e.to_string()))
    }

    // =====================================================================
    // Accounts
    // =====================================================================

    pub fn create_account(
        &self,
        username: &str,
        platform_user_id: &str,
        access_token: &str,
    ) -> Result<AccountId> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (username, platform_user_id, access_token, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, platform_user_id, access_token, ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(AccountId(conn.last_insert_rowid()))
    }

    /// Gateway credentials for an account: (platform user id, access token).
    pub fn account_credentials(&self, account: AccountId) -> Result<(String, String)> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT platform_user_id, access_token FROM accounts WHERE id = ?1 AND active = 1",
            params![account.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?
        .ok_or(DmFlowError::Database(format!(
            "account {} missing or inactive",
            account
        )))
    }

    /// True once a comment id has produced a session or sits in the
    /// trigger queue. Webhooks redeliver, so comment events must be
    /// idempotent.
    pub fn comment_already_handled(&self, comment_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let seen: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sessions WHERE trigger_comment_id = ?1)
                 OR EXISTS(SELECT 1 FROM triggers
                           WHERE status = 'pending'
                             AND json_extract(comment, '$.comment_id') = ?1)",
                params![comment_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(seen)
    }

    /// Resolve a webhook entry id to an account. Inactive accounts do not
    /// match.
    pub fn account_by_platform_id(&self, platform_user_id: &str) -> Result<Option<AccountId>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id FROM accounts WHERE platform_user_id = ?1 AND active = 1",
            params![platform_user_id],
            |row| Ok(AccountId(row.get(0)?)),
        )
        .optional()
        .map_err(db_err)
    }

    // =====================================================================
    // Flows
    // =====================================================================

    pub fn create_flow(
        &self,
        account: AccountId,
        title: &str,
        trigger: &TriggerPredicate,
    ) -> Result<FlowId> {
        let conn = self.lock()?;
        let keywords = serde_json::to_string(&trigger.keywords)?;
        conn.execute(
            "INSERT INTO flows (account_id, title, trigger_post_id, trigger_keywords, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account.0, title, trigger.post_id, keywords, ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(FlowId(conn.last_insert_rowid()))
    }

    pub fn add_node(
        &self,
        flow: FlowId,
        order: i64,
        next_node: Option<NodeId>,
        kind: &NodeKind,
    ) -> Result<NodeId> {
        let conn = self.lock()?;
        let config = serde_json::to_string(kind)?;
        conn.execute(
            "INSERT INTO nodes (flow_id, ord, next_node, config) VALUES (?1, ?2, ?3, ?4)",
            params![flow.0, order, next_node.map(|n| n.0), config],
        )
        .map_err(db_err)?;
        Ok(NodeId(conn.last_insert_rowid()))
    }

    /// Patch a node's config in place (used by fixtures that need forward
    /// references between nodes).
    pub fn update_node_kind(&self, node: NodeId, kind: &NodeKind) -> Result<()> {
        let conn = self.lock()?;
        let config = serde_json::to_string(kind)?;
        conn.execute(
            "UPDATE nodes SET config = ?1 WHERE id = ?2",
            params![config, node.0],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn set_node_next(&self, node: NodeId, next: Option<NodeId>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE nodes SET next_node = ?1 WHERE id = ?2",
            params![next.map(|n| n.0), node.0],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a full flow definition with its nodes sorted by order.
    pub fn load_flow(&self, id: FlowId) -> Result<FlowDefinition> {
        let conn = self.lock()?;
        let (account, title, active, post_id, keywords): (i64, String, bool, Option<String>, String) =
            conn.query_row(
                "SELECT account_id, title, active, trigger_post_id, trigger_keywords
                 FROM flows WHERE id = ?1",
                params![id.0],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?
            .ok_or(DmFlowError::FlowNotFound(id.0))?;

        let mut stmt = conn
            .prepare("SELECT id, ord, next_node, config FROM nodes WHERE flow_id = ?1 ORDER BY ord")
            .map_err(db_err)?;
        let nodes = stmt
            .query_map(params![id.0], node_from_row)
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(FlowDefinition {
            id,
            account: AccountId(account),
            title,
            active,
            trigger: TriggerPredicate {
                post_id,
                keywords: serde_json::from_str(&keywords)?,
            },
            nodes,
        })
    }

    /// First matching active flow for a comment, newest first.
    pub fn find_matching_flow(
        &self,
        account: AccountId,
        post_id: &str,
        comment_text: &str,
    ) -> Result<Option<FlowDefinition>> {
        let ids: Vec<i64> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM flows
                     WHERE account_id = ?1 AND active = 1
                     ORDER BY created_at DESC, id DESC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![account.0], |row| row.get(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        for id in ids {
            let flow = self.load_flow(FlowId(id))?;
            if flow.trigger.matches(post_id, comment_text) {
                return Ok(Some(flow));
            }
        }
        Ok(None)
    }

    // =====================================================================
    // Sessions
    // =====================================================================

    pub fn create_session(
        &self,
        flow: &FlowDefinition,
        comment: &CommentEvent,
    ) -> Result<FlowSession> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions
                (flow_id, account_id, igsid, username, trigger_comment_id, trigger_post_id,
                 trigger_comment_text, status, state, variables, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', '{}', '{}', ?8, ?8)",
            params![
                flow.id.0,
                flow.account.0,
                comment.commenter_id,
                comment.commenter_username,
                comment.comment_id,
                comment.post_id,
                comment.text,
                ts(now),
            ],
        )
        .map_err(db_err)?;

        Ok(FlowSession {
            id: SessionId(conn.last_insert_rowid()),
            flow: flow.id,
            account: flow.account,
            igsid: comment.commenter_id.clone(),
            username: comment.commenter_username.clone(),
            trigger_comment_id: Some(comment.comment_id.clone()),
            trigger_post_id: Some(comment.post_id.clone()),
            trigger_comment_text: Some(comment.text.clone()),
            current_node: None,
            status: SessionStatus::Active,
            state: EngineState::default(),
            variables: HashMap::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn load_session(&self, id: SessionId) -> Result<FlowSession> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, flow_id, account_id, igsid, username, trigger_comment_id,
                    trigger_post_id, trigger_comment_text, current_node, status, state,
                    variables, error_message, created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![id.0],
            session_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or(DmFlowError::SessionNotFound(id.0))
    }

    /// Persist the mutable parts of a session.
    pub fn update_session(&self, session: &FlowSession) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sessions SET current_node = ?1, status = ?2, state = ?3,
                    variables = ?4, error_message = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                session.current_node.map(|n| n.0),
                session.status.as_str(),
                serde_json::to_string(&session.state)?,
                serde_json::to_string(&session.variables)?,
                session.error_message,
                ts(Utc::now()),
                session.id.0,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Most recently updated session for this end-user still awaiting
    /// input, used to route free-text replies and clicks.
    pub fn find_open_session(
        &self,
        account: AccountId,
        igsid: &str,
    ) -> Result<Option<FlowSession>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, flow_id, account_id, igsid, username, trigger_comment_id,
                    trigger_post_id, trigger_comment_text, current_node, status, state,
                    variables, error_message, created_at, updated_at
             FROM sessions
             WHERE account_id = ?1 AND igsid = ?2 AND status IN ('active', 'waiting_reply')
             ORDER BY updated_at DESC LIMIT 1",
            params![account.0, igsid],
            session_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Count *other* completed sessions of a flow for this end-user, with
    /// an optional completion-time lower bound.
    pub fn completed_sessions_since(
        &self,
        flow: FlowId,
        igsid: &str,
        exclude: SessionId,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let conn = self.lock()?;
        let count: u32 = match cutoff {
            Some(c) => conn
                .query_row(
                    "SELECT COUNT(*) FROM sessions
                     WHERE flow_id = ?1 AND igsid = ?2 AND id != ?3
                       AND status = 'completed' AND updated_at >= ?4",
                    params![flow.0, igsid, exclude.0, ts(c)],
                    |row| row.get(0),
                )
                .map_err(db_err)?,
            None => conn
                .query_row(
                    "SELECT COUNT(*) FROM sessions
                     WHERE flow_id = ?1 AND igsid = ?2 AND id != ?3 AND status = 'completed'",
                    params![flow.0, igsid, exclude.0],
                    |row| row.get(0),
                )
                .map_err(db_err)?,
        };
        Ok(count)
    }

    // =====================================================================
    // Execution log
    // =====================================================================

    pub fn log_action(
        &self,
        session: SessionId,
        node: Option<NodeId>,
        action: LogAction,
        details: serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO execution_log (session_id, node_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.0,
                node.map(|n| n.0),
                action.as_str(),
                details.to_string(),
                ts(Utc::now()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Whether any log entry with this action exists for the session.
    pub fn has_log_action(&self, session: SessionId, action: LogAction) -> Result<bool> {
        let conn = self.lock()?;
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM execution_log WHERE session_id = ?1 AND action = ?2",
                params![session.0, action.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Atomic duplicate-send guard: inside one transaction, check for a
    /// `message_sent` entry for this (session, node) within `window_secs`,
    /// and insert one only if absent. Returns `false` when the send must be
    /// suppressed.
    pub fn try_mark_message_sent(
        &self,
        session: SessionId,
        node: NodeId,
        window_secs: i64,
        details: serde_json::Value,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let cutoff = ts(Utc::now() - chrono::Duration::seconds(window_secs));

        let recent: u32 = tx
            .query_row(
                "SELECT COUNT(*) FROM execution_log
                 WHERE session_id = ?1 AND node_id = ?2 AND action = 'message_sent'
                   AND created_at >= ?3",
                params![session.0, node.0, cutoff],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        if recent > 0 {
            tx.rollback().map_err(db_err)?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO execution_log (session_id, node_id, action, details, created_at)
             VALUES (?1, ?2, 'message_sent', ?3, ?4)",
            params![session.0, node.0, details.to_string(), ts(Utc::now())],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    /// Count `message_sent` log entries for one (session, node).
    pub fn message_sent_count(&self, session: SessionId, node: NodeId) -> Result<u32> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM execution_log
             WHERE session_id = ?1 AND node_id = ?2 AND action = 'message_sent'",
            params![session.0, node.0],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    /// All log actions for a session, oldest first (test/diagnostic helper).
    pub fn session_log(&self, session: SessionId) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT action FROM execution_log WHERE session_id = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session.0], |row| row.get(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err);
        rows
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<FlowNode> {
    let config: String = row.get(3)?;
    let kind: NodeKind = serde_json::from_str(&config).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(FlowNode {
        id: NodeId(row.get(0)?),
        order: row.get(1)?,
        next_node: row.get::<_, Option<i64>>(2)?.map(NodeId),
        kind,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<FlowSession> {
    let status: String = row.get(9)?;
    let state: String = row.get(10)?;
    let variables: String = row.get(11)?;
    let created: String = row.get(13)?;
    let updated: String = row.get(14)?;

    Ok(FlowSession {
        id: SessionId(row.get(0)?),
        flow: FlowId(row.get(1)?),
        account: AccountId(row.get(2)?),
        igsid: row.get(3)?,
        username: row.get(4)?,
        trigger_comment_id: row.get(5)?,
        trigger_post_id: row.get(6)?,
        trigger_comment_text: row.get(7)?,
        current_node: row.get::<_, Option<i64>>(8)?.map(NodeId),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Error),
        state: serde_json::from_str(&state).unwrap_or_default(),
        variables: serde_json::from_str(&variables).unwrap_or_default(),
        error_message: row.get(12)?,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (SqliteStore, FlowDefinition, CommentEvent) {
        let store = SqliteStore::in_memory().unwrap();
        let account = store.create_account("shop", "ig_1", "token").unwrap();
        let flow_id = store
            .create_flow(
                account,
                "Promo",
                &TriggerPredicate {
                    post_id: None,
                    keywords: vec!["help".into()],
                },
            )
            .unwrap();
        store
            .add_node(flow_id, 0, None, &NodeKind::MessageText { texts: vec!["hi".into()] })
            .unwrap();
        let flow = store.load_flow(flow_id).unwrap();
        let comment = CommentEvent {
            comment_id: "c1".into(),
            post_id: "p1".into(),
            commenter_id: "user_9".into(),
            commenter_username: "jo".into(),
            text: "help".into(),
        };
        (store, flow, comment)
    }

    #[test]
    fn flow_round_trip() {
        let (store, flow, _) = seeded();
        assert_eq!(flow.nodes.len(), 1);
        assert!(flow.active);
        assert!(matches!(flow.nodes[0].kind, NodeKind::MessageText { .. }));
        let found = store.find_matching_flow(flow.account, "p1", "HELP me").unwrap();
        assert_eq!(found.unwrap().id, flow.id);
        let none = store.find_matching_flow(flow.account, "p1", "hello").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn session_create_update_load() {
        let (store, flow, comment) = seeded();
        let mut session = store.create_session(&flow, &comment).unwrap();
        assert_eq!(session.status, SessionStatus::Active);

        session.status = SessionStatus::WaitingReply;
        session.current_node = Some(flow.nodes[0].id);
        session.state.node_executions = 3;
        session
            .variables
            .insert("email".into(), serde_json::json!("a@b.com"));
        store.update_session(&session).unwrap();

        let loaded = store.load_session(session.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::WaitingReply);
        assert_eq!(loaded.state.node_executions, 3);
        assert_eq!(loaded.variables["email"], serde_json::json!("a@b.com"));

        let open = store.find_open_session(flow.account, "user_9").unwrap();
        assert_eq!(open.unwrap().id, session.id);
    }

    #[test]
    fn duplicate_send_guard_within_window() {
        let (store, flow, comment) = seeded();
        let session = store.create_session(&flow, &comment).unwrap();
        let node = flow.nodes[0].id;

        assert!(store
            .try_mark_message_sent(session.id, node, 3, serde_json::json!({}))
            .unwrap());
        assert!(!store
            .try_mark_message_sent(session.id, node, 3, serde_json::json!({}))
            .unwrap());
        assert_eq!(store.message_sent_count(session.id, node).unwrap(), 1);
    }

    #[test]
    fn completed_session_lookback() {
        let (store, flow, comment) = seeded();
        let mut first = store.create_session(&flow, &comment).unwrap();
        first.status = SessionStatus::Completed;
        store.update_session(&first).unwrap();

        let second = store.create_session(&flow, &comment).unwrap();
        let ever = store
            .completed_sessions_since(flow.id, "user_9", second.id, None)
            .unwrap();
        assert_eq!(ever, 1);

        let future = Some(Utc::now() + chrono::Duration::hours(1));
        let none = store
            .completed_sessions_since(flow.id, "user_9", second.id, future)
            .unwrap();
        assert_eq!(none, 0);
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dmflow.db");
        let store = SqliteStore::open(&path).unwrap();
        store.create_account("shop", "ig_1", "token").unwrap();
        assert!(path.exists());
    }
}
