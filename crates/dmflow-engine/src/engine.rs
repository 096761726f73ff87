//! Flow execution engine.
//!
//! The engine walks a flow graph one webhook delivery at a time: a trigger
//! or inbound response resolves to a session and a starting node, the
//! traversal loop runs node handlers until the flow suspends (waiting for
//! an external reply), completes, or errors. All outbound sends go through
//! the injected [`MessagingGateway`]; the AI hand-off goes through the
//! injected [`ConversationAgent`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::payload::ResponsePayload;
use dmflow_core::traits::{ConversationAgent, MessagingGateway};
use dmflow_core::types::*;
use dmflow_store::SqliteStore;

use crate::branch::BranchTargets;

/// Total node executions allowed per session.
pub const MAX_NODE_EXECUTIONS: u32 = 30;
/// Executions allowed for any single node per session.
pub const MAX_PER_NODE_EXECUTIONS: u32 = 5;
/// Window within which a repeated send of the same node is suppressed.
pub const DUPLICATE_SEND_WINDOW_SECS: i64 = 3;

/// What `process_trigger` did with a queued trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The trigger was claimed and a session ran.
    Processed {
        session: SessionId,
        status: SessionStatus,
    },
    /// Another delivery already claimed the trigger.
    AlreadyHandled,
    /// The flow was deactivated after the trigger was queued.
    FlowInactive,
}

/// Where the traversal goes after one node handler returns.
enum Step {
    /// Jump to an explicit branch target.
    Goto(NodeId),
    /// Apply the advance-to-next rule.
    Advance,
    /// Persist as waiting_reply and return to the caller.
    Suspend,
    /// The flow is done.
    Complete,
    /// The session was already moved to `error`; stop silently.
    Halt,
}

/// Builds an engine bound to one account's gateway credentials. Long-
/// lived components (server, queue worker) serve many accounts, so they
/// hold a provider instead of a single engine.
pub trait EngineProvider: Send + Sync + 'static {
    fn engine_for(&self, account: AccountId) -> Result<FlowEngine>;
}

impl<F> EngineProvider for F
where
    F: Fn(AccountId) -> Result<FlowEngine> + Send + Sync + 'static,
{
    fn engine_for(&self, account: AccountId) -> Result<FlowEngine> {
        self(account)
    }
}

pub struct FlowEngine {
    pub(crate) store: Arc<SqliteStore>,
    pub(crate) gateway: Arc<dyn MessagingGateway>,
    pub(crate) agent: Arc<dyn ConversationAgent>,
}

impl FlowEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        gateway: Arc<dyn MessagingGateway>,
        agent: Arc<dyn ConversationAgent>,
    ) -> Self {
        Self {
            store,
            gateway,
            agent,
        }
    }

    // =====================================================================
    // Entry points
    // =====================================================================

    /// Start a new session for a comment that matched `flow`'s trigger.
    pub async fn trigger_from_comment(
        &self,
        flow: &FlowDefinition,
        comment: &CommentEvent,
    ) -> Result<FlowSession> {
        info!(
            flow = %flow.id,
            comment = %comment.comment_id,
            "Triggering flow from comment"
        );

        let mut session = self.store.create_session(flow, comment)?;
        self.store.log_action(
            session.id,
            None,
            LogAction::FlowStarted,
            json!({
                "comment_id": comment.comment_id,
                "post_id": comment.post_id,
                "comment_text": comment.text,
            }),
        )?;

        let entry = match flow.entry_node() {
            Some(node) => node.id,
            None => {
                self.fail_session(
                    &mut session,
                    None,
                    "Flow has no nodes configured",
                    "empty_flow",
                )?;
                return Ok(session);
            }
        };

        if let Err(e) = self.run_from(flow, &mut session, entry).await {
            let node = session.current_node;
            self.fail_session(&mut session, node, &e.to_string(), "engine_error")?;
        }
        Ok(session)
    }

    /// Queue-worker entry point. Idempotent: a trigger that is no longer
    /// `pending` is left alone.
    pub async fn process_trigger(&self, trigger_id: TriggerId) -> Result<TriggerOutcome> {
        if !self.store.claim_trigger(trigger_id)? {
            debug!(trigger = %trigger_id, "Trigger already claimed, skipping");
            return Ok(TriggerOutcome::AlreadyHandled);
        }

        let trigger = self.store.load_trigger(trigger_id)?;
        let flow = match self.store.load_flow(trigger.flow) {
            Ok(flow) => flow,
            Err(e) => {
                self.store.finish_trigger(trigger_id, TriggerStatus::Failed)?;
                return Err(e);
            }
        };

        if !flow.active {
            warn!(trigger = %trigger_id, flow = %flow.id, "Flow inactive, dropping trigger");
            self.store.finish_trigger(trigger_id, TriggerStatus::Failed)?;
            return Ok(TriggerOutcome::FlowInactive);
        }

        let session = self.trigger_from_comment(&flow, &trigger.comment).await?;
        let trigger_status = if session.status == SessionStatus::Error {
            TriggerStatus::Failed
        } else {
            TriggerStatus::Completed
        };
        self.store.finish_trigger(trigger_id, trigger_status)?;

        Ok(TriggerOutcome::Processed {
            session: session.id,
            status: session.status,
        })
    }

    // =====================================================================
    // Traversal
    // =====================================================================

    /// Run the traversal loop starting at `start` until the session
    /// suspends, completes, or errors.
    pub async fn run_from(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        start: NodeId,
    ) -> Result<()> {
        let targets = BranchTargets::compute(flow);
        let mut next = Some(start);

        while let Some(node_id) = next {
            let node = match flow.node(node_id) {
                Some(node) => node,
                None => {
                    self.fail_session(
                        session,
                        Some(node_id),
                        &format!("Node {} not found in flow {}", node_id, flow.id),
                        "node_not_found",
                    )?;
                    return Ok(());
                }
            };

            // Loop guards, evaluated before any side effect.
            session.state.node_executions += 1;
            if session.state.node_executions > MAX_NODE_EXECUTIONS {
                self.fail_session(
                    session,
                    Some(node.id),
                    &format!(
                        "Session exceeded {} total node executions",
                        MAX_NODE_EXECUTIONS
                    ),
                    "infinite_loop_detected",
                )?;
                return Ok(());
            }
            let per_node = session
                .state
                .per_node_executions
                .entry(node.id.0)
                .or_insert(0);
            *per_node += 1;
            if *per_node > MAX_PER_NODE_EXECUTIONS {
                self.fail_session(
                    session,
                    Some(node.id),
                    &format!(
                        "Node {} exceeded {} executions",
                        node.id, MAX_PER_NODE_EXECUTIONS
                    ),
                    "node_loop_detected",
                )?;
                return Ok(());
            }

            session.current_node = Some(node.id);
            session.status = SessionStatus::Active;
            self.store.update_session(session)?;
            self.store.log_action(
                session.id,
                Some(node.id),
                LogAction::NodeExecuted,
                json!({"node_type": node.kind.name(), "node_order": node.order}),
            )?;
            debug!(session = %session.id, node = %node.id, kind = node.kind.name(), "Executing node");

            match self.execute_node(flow, session, node).await? {
                Step::Goto(id) => next = Some(id),
                Step::Advance => match self.advance(flow, node, &targets) {
                    Some(id) => next = Some(id),
                    None => {
                        self.complete(session)?;
                        return Ok(());
                    }
                },
                Step::Suspend => {
                    session.status = SessionStatus::WaitingReply;
                    self.store.update_session(session)?;
                    return Ok(());
                }
                Step::Complete => {
                    self.complete(session)?;
                    return Ok(());
                }
                Step::Halt => return Ok(()),
            }
        }

        self.complete(session)
    }

    /// Apply the advance-to-next rule from `node` and keep running, used
    /// when an inbound response resumes a suspended session.
    pub(crate) async fn advance_from(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        node: &FlowNode,
    ) -> Result<()> {
        let targets = BranchTargets::compute(flow);
        match self.advance(flow, node, &targets) {
            Some(id) => self.run_from(flow, session, id).await,
            None => self.complete(session),
        }
    }

    /// Advance-to-next rule: explicit `next_node` wins; a branch target
    /// without one ends its branch (the flow completes); otherwise the
    /// next node by ascending order.
    fn advance(
        &self,
        flow: &FlowDefinition,
        node: &FlowNode,
        targets: &BranchTargets,
    ) -> Option<NodeId> {
        if let Some(next) = node.next_node {
            return Some(next);
        }
        if targets.contains(node.id) {
            debug!(node = %node.id, "Branch target with no successor, completing");
            return None;
        }
        flow.next_by_order(node.order).map(|n| n.id)
    }

    // =====================================================================
    // Node handlers
    // =====================================================================

    async fn execute_node(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        node: &FlowNode,
    ) -> Result<Step> {
        match &node.kind {
            NodeKind::CommentReply { texts } => self.node_comment_reply(session, node, texts).await,
            NodeKind::MessageText { texts } => self.node_message_text(session, node, texts).await,
            NodeKind::MessageLink { texts, url } => {
                self.node_message_link(session, node, texts, url).await
            }
            NodeKind::MessageQuickReply { texts, options } => {
                self.node_quick_reply(session, node, texts, options).await
            }
            NodeKind::MessageButtonTemplate { texts, buttons } => {
                self.node_button_template(session, node, texts, buttons).await
            }
            NodeKind::ConditionFollower {
                true_node,
                false_node,
            } => {
                self.node_condition_follower(flow, session, node, *true_node, *false_node)
                    .await
            }
            NodeKind::ConditionUserInteracted {
                window,
                true_node,
                false_node,
            } => {
                self.node_condition_interacted(flow, session, node, *window, *true_node, *false_node)
            }
            NodeKind::CollectData {
                field,
                prompt,
                variable,
                ..
            } => self.node_collect_data(session, node, *field, prompt, variable).await,
            NodeKind::AiConversation { fallback_node } => {
                self.node_ai_conversation(flow, session, node, *fallback_node)
                    .await
            }
        }
    }

    async fn node_comment_reply(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        texts: &[String],
    ) -> Result<Step> {
        let Some(comment_id) = session.trigger_comment_id.clone() else {
            warn!(session = %session.id, "No trigger comment, skipping comment reply");
            return Ok(Step::Advance);
        };
        let Some(text) = pick_text(texts) else {
            warn!(node = %node.id, "Comment reply node has no text");
            return Ok(Step::Advance);
        };
        let text = substitute(&text, &session.variables);

        let result = self.gateway.reply_to_comment(&comment_id, &text).await;
        self.store
            .record_api_call(session.account, "reply_to_comment", result.is_ok())?;
        match result {
            Ok(()) => {
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::CommentReplied,
                    json!({"text": text}),
                )?;
            }
            // A failed public reply never blocks the DM flow.
            Err(e) => {
                warn!(session = %session.id, "Comment reply failed: {}", e);
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::Error,
                    json!({"error": e.to_string()}),
                )?;
            }
        }
        Ok(Step::Advance)
    }

    async fn node_message_text(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        texts: &[String],
    ) -> Result<Step> {
        let Some(text) = pick_text(texts) else {
            warn!(node = %node.id, "Message node has no text");
            return Ok(Step::Advance);
        };
        let text = substitute(&text, &session.variables);

        let to = self.recipient(session)?;
        let result = self.gateway.send_text(&to, &text).await;
        self.store
            .record_api_call(session.account, "send_text", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }

        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::MessageSent,
            json!({"text": text}),
        )?;
        Ok(Step::Advance)
    }

    async fn node_message_link(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        texts: &[String],
        url: &str,
    ) -> Result<Step> {
        let text = pick_text(texts).unwrap_or_default();
        if text.is_empty() && url.is_empty() {
            warn!(node = %node.id, "Link node has no content");
            return Ok(Step::Advance);
        }
        let text = substitute(&text, &session.variables);
        let full = if !url.is_empty() && !text.contains(url) {
            format!("{}\n{}", text, url)
        } else {
            text.clone()
        };

        let to = self.recipient(session)?;
        let result = self.gateway.send_text(&to, &full).await;
        self.store
            .record_api_call(session.account, "send_text", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }

        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::MessageSent,
            json!({"text": text, "url": url}),
        )?;
        Ok(Step::Advance)
    }

    async fn node_quick_reply(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        texts: &[String],
        options: &[QuickReplyOption],
    ) -> Result<Step> {
        let Some(text) = pick_text(texts) else {
            warn!(node = %node.id, "Quick reply node has no text");
            return Ok(Step::Advance);
        };
        let text = substitute(&text, &session.variables);

        if options.is_empty() {
            warn!(node = %node.id, "Quick reply node has no options, sending plain text");
            let to = self.recipient(session)?;
            let result = self.gateway.send_text(&to, &text).await;
            self.store
                .record_api_call(session.account, "send_text", result.is_ok())?;
            if let Err(e) = result {
                return self.send_failed(session, node.id, e);
            }
            self.store.log_action(
                session.id,
                Some(node.id),
                LogAction::MessageSent,
                json!({"text": text}),
            )?;
            return Ok(Step::Advance);
        }

        let chips: Vec<QuickReplyButton> = options
            .iter()
            .take(13)
            .map(|opt| QuickReplyButton {
                title: opt.title.chars().take(20).collect(),
                payload: ResponsePayload::quick_reply(session.id, node.id, opt.payload.clone())
                    .encode(),
            })
            .collect();

        // Resolve the recipient before the duplicate guard inserts its
        // `message_sent` entry, or the first-send check would flip.
        let to = self.recipient(session)?;
        let titles: Vec<&str> = chips.iter().map(|c| c.title.as_str()).collect();
        if !self.store.try_mark_message_sent(
            session.id,
            node.id,
            DUPLICATE_SEND_WINDOW_SECS,
            json!({"text": text, "quick_replies": titles}),
        )? {
            warn!(session = %session.id, node = %node.id, "Duplicate quick reply send suppressed");
            return Ok(Step::Suspend);
        }

        let result = self.gateway.send_quick_replies(&to, &text, &chips).await;
        self.store
            .record_api_call(session.account, "send_quick_replies", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }
        Ok(Step::Suspend)
    }

    async fn node_button_template(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        texts: &[String],
        buttons: &[ButtonSpec],
    ) -> Result<Step> {
        let Some(text) = pick_text(texts) else {
            warn!(node = %node.id, "Button template node has no text");
            return Ok(Step::Advance);
        };
        let text = substitute(&text, &session.variables);

        if buttons.is_empty() {
            warn!(node = %node.id, "Button template node has no buttons, sending plain text");
            let to = self.recipient(session)?;
            let result = self.gateway.send_text(&to, &text).await;
            self.store
                .record_api_call(session.account, "send_text", result.is_ok())?;
            if let Err(e) = result {
                return self.send_failed(session, node.id, e);
            }
            self.store.log_action(
                session.id,
                Some(node.id),
                LogAction::MessageSent,
                json!({"text": text}),
            )?;
            return Ok(Step::Advance);
        }

        let prepared: Vec<TemplateButton> = buttons
            .iter()
            .take(3)
            .map(|button| match button {
                ButtonSpec::WebUrl { title, url } => TemplateButton::WebUrl {
                    title: title.clone(),
                    url: url.clone(),
                },
                ButtonSpec::Postback { title, payload, .. } => TemplateButton::Postback {
                    title: title.clone(),
                    payload: ResponsePayload::button(session.id, node.id, payload.clone()).encode(),
                },
            })
            .collect();
        let has_postback = prepared
            .iter()
            .any(|b| matches!(b, TemplateButton::Postback { .. }));

        let to = self.recipient(session)?;
        let titles: Vec<&str> = prepared
            .iter()
            .map(|b| match b {
                TemplateButton::WebUrl { title, .. } | TemplateButton::Postback { title, .. } => {
                    title.as_str()
                }
            })
            .collect();
        if !self.store.try_mark_message_sent(
            session.id,
            node.id,
            DUPLICATE_SEND_WINDOW_SECS,
            json!({"text": text, "buttons": titles, "template_type": "button"}),
        )? {
            warn!(session = %session.id, node = %node.id, "Duplicate button template send suppressed");
            return Ok(if has_postback { Step::Suspend } else { Step::Advance });
        }

        let result = self.gateway.send_button_template(&to, &text, &prepared).await;
        self.store
            .record_api_call(session.account, "send_button_template", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }

        // All-URL templates produce no webhook response to wait for.
        Ok(if has_postback { Step::Suspend } else { Step::Advance })
    }

    async fn node_condition_follower(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        node: &FlowNode,
        true_node: Option<NodeId>,
        false_node: Option<NodeId>,
    ) -> Result<Step> {
        let consent = session.state.consent_granted
            || self
                .store
                .has_log_action(session.id, LogAction::QuickReplyReceived)?;

        if !consent {
            // Profile lookups need prior user interaction. Without it,
            // route to the false branch and never touch the gateway.
            warn!(
                session = %session.id,
                "Follower check before any user interaction, taking false branch"
            );
            self.store.log_action(
                session.id,
                Some(node.id),
                LogAction::ConditionChecked,
                json!({"condition": "follower_check", "error": "user_consent_required"}),
            )?;
            session.variables.insert("is_follower".into(), Value::Null);
            return Ok(self.route_branch(flow, false_node));
        }

        let (is_follower, profile) = match self.gateway.get_profile(&session.igsid).await {
            Ok(profile) => {
                self.store.record_api_call(session.account, "get_profile", true)?;
                (profile.is_follower, Some(profile))
            }
            Err(e) => {
                self.store.record_api_call(session.account, "get_profile", false)?;
                warn!(session = %session.id, "Profile lookup failed: {}", e);
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::Error,
                    json!({"error": e.to_string(), "error_type": "api_error"}),
                )?;
                (false, None)
            }
        };

        session
            .variables
            .insert("is_follower".into(), json!(is_follower));
        if let Some(ref profile) = profile {
            session.variables.insert(
                "user_profile".into(),
                json!({
                    "name": profile.name,
                    "username": profile.username,
                    "follower_count": profile.follower_count,
                    "is_verified": profile.is_verified,
                }),
            );
        }

        let mut lead = CollectedLead {
            account: session.account,
            igsid: session.igsid.clone(),
            username: session.username.clone(),
            is_follower: Some(is_follower),
            ..Default::default()
        };
        if let Some(ref profile) = profile {
            lead.name = profile.name.clone();
        }
        self.store.upsert_lead(&lead)?;

        let branch = if is_follower { true_node } else { false_node };
        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::ConditionChecked,
            json!({
                "condition": "follower_check",
                "result": if is_follower { "is_follower" } else { "not_follower" },
                "next_node_id": branch.map(|n| n.0),
            }),
        )?;
        Ok(self.route_branch(flow, branch))
    }

    fn node_condition_interacted(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        node: &FlowNode,
        window: LookbackWindow,
        true_node: Option<NodeId>,
        false_node: Option<NodeId>,
    ) -> Result<Step> {
        let cutoff = window.cutoff(Utc::now());
        let completed =
            self.store
                .completed_sessions_since(flow.id, &session.igsid, session.id, cutoff)?;
        let interacted = completed > 0;

        let branch = if interacted { true_node } else { false_node };
        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::ConditionChecked,
            json!({
                "condition": "user_interacted",
                "window": window,
                "result": interacted,
                "next_node_id": branch.map(|n| n.0),
            }),
        )?;
        Ok(self.route_branch(flow, branch))
    }

    async fn node_collect_data(
        &self,
        session: &mut FlowSession,
        node: &FlowNode,
        field: FieldType,
        prompt: &str,
        variable: &str,
    ) -> Result<Step> {
        if prompt.is_empty() {
            warn!(node = %node.id, "Collect data node has no prompt");
            return Ok(Step::Advance);
        }
        let variable = if variable.is_empty() {
            format!("collected_{}", field.as_str())
        } else {
            variable.to_string()
        };

        session.state.collecting = Some(Collecting {
            node: node.id,
            field,
            variable: variable.clone(),
        });

        let to = Recipient::User(session.igsid.clone());
        let result = self.gateway.send_text(&to, prompt).await;
        self.store
            .record_api_call(session.account, "send_text", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }

        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::MessageSent,
            json!({"prompt": prompt, "field_type": field.as_str(), "variable_name": variable}),
        )?;
        Ok(Step::Suspend)
    }

    async fn node_ai_conversation(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        node: &FlowNode,
        fallback_node: Option<NodeId>,
    ) -> Result<Step> {
        let available = match self.agent.available(session.account).await {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %session.id, "Agent availability check failed: {}", e);
                false
            }
        };
        if !available {
            // Fail closed: skip the AI node rather than stall the flow.
            info!(session = %session.id, node = %node.id, "Agent unavailable, taking fallback");
            return Ok(self.ai_fallback(flow, node, fallback_node));
        }

        let opening = match self.agent.start(session, node.id).await {
            Ok(message) => message,
            Err(e) => {
                warn!(session = %session.id, "Agent start failed: {}", e);
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::Error,
                    json!({"error": e.to_string(), "source": "agent"}),
                )?;
                return Ok(self.ai_fallback(flow, node, fallback_node));
            }
        };

        let to = self.recipient(session)?;
        let result = self.gateway.send_text(&to, &opening).await;
        self.store
            .record_api_call(session.account, "send_text", result.is_ok())?;
        if let Err(e) = result {
            return self.send_failed(session, node.id, e);
        }

        self.store.log_action(
            session.id,
            Some(node.id),
            LogAction::MessageSent,
            json!({"text": opening, "source": "agent"}),
        )?;
        session.state.ai_conversation = true;
        Ok(Step::Suspend)
    }

    fn ai_fallback(
        &self,
        flow: &FlowDefinition,
        _node: &FlowNode,
        fallback_node: Option<NodeId>,
    ) -> Step {
        match fallback_node {
            Some(id) if flow.node(id).is_some() => Step::Goto(id),
            _ => Step::Advance,
        }
    }

    // =====================================================================
    // Helpers
    // =====================================================================

    fn route_branch(&self, flow: &FlowDefinition, target: Option<NodeId>) -> Step {
        match target {
            Some(id) if flow.node(id).is_some() => Step::Goto(id),
            Some(id) => {
                warn!(node = %id, "Branch target missing from flow, completing");
                Step::Complete
            }
            None => Step::Complete,
        }
    }

    /// First message of a session goes through the comment-id path to
    /// open the conversation; everything after addresses the IGSID.
    fn recipient(&self, session: &FlowSession) -> Result<Recipient> {
        if let Some(ref comment_id) = session.trigger_comment_id {
            if !self.store.has_log_action(session.id, LogAction::MessageSent)? {
                return Ok(Recipient::Comment(comment_id.clone()));
            }
        }
        Ok(Recipient::User(session.igsid.clone()))
    }

    fn send_failed(
        &self,
        session: &mut FlowSession,
        node: NodeId,
        e: DmFlowError,
    ) -> Result<Step> {
        let tag = if e.is_messaging_restricted() {
            "messaging_restricted"
        } else {
            "gateway_error"
        };
        self.fail_session(session, Some(node), &e.to_string(), tag)?;
        Ok(Step::Halt)
    }

    pub(crate) fn fail_session(
        &self,
        session: &mut FlowSession,
        node: Option<NodeId>,
        message: &str,
        tag: &str,
    ) -> Result<()> {
        warn!(session = %session.id, tag, "Session errored: {}", message);
        session.status = SessionStatus::Error;
        session.error_message = Some(message.to_string());
        self.store.update_session(session)?;
        self.store.log_action(
            session.id,
            node,
            LogAction::Error,
            json!({"error": message, "tag": tag}),
        )
    }

    pub(crate) fn complete(&self, session: &mut FlowSession) -> Result<()> {
        info!(session = %session.id, "Flow completed");
        session.status = SessionStatus::Completed;
        self.store.update_session(session)?;
        self.store
            .log_action(session.id, None, LogAction::FlowCompleted, json!({}))
    }
}

/// Pick one non-empty text variant at random.
fn pick_text(texts: &[String]) -> Option<String> {
    let candidates: Vec<&String> = texts.iter().filter(|t| !t.is_empty()).collect();
    candidates
        .choose(&mut rand::thread_rng())
        .map(|s| (*s).clone())
}

/// Substitute `{variable}` placeholders from the collected variables map.
fn substitute(text: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = text.to_string();
    for (key, value) in variables {
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{}}}", key), &rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmflow_test_utils::{comment, store_with_account, MockAgent, MockGateway, SentMessage};

    struct Setup {
        engine: FlowEngine,
        store: Arc<SqliteStore>,
        gateway: Arc<MockGateway>,
        account: AccountId,
    }

    fn setup() -> Setup {
        let (store, account) = store_with_account();
        let store = Arc::new(store);
        let gateway = Arc::new(MockGateway::new());
        let agent = Arc::new(MockAgent::new());
        let engine = FlowEngine::new(store.clone(), gateway.clone(), agent);
        Setup {
            engine,
            store,
            gateway,
            account,
        }
    }

    fn text_node(texts: &[&str]) -> NodeKind {
        NodeKind::MessageText {
            texts: texts.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn first_message_uses_comment_path_then_igsid() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Promo", &TriggerPredicate::default())
            .unwrap();
        s.store.add_node(flow_id, 0, None, &text_node(&["hello"])).unwrap();
        s.store.add_node(flow_id, 1, None, &text_node(&["again"])).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);

        let sent = s.gateway.sent();
        assert_eq!(sent.len(), 2);
        assert!(
            matches!(&sent[0], SentMessage::Text { to: Recipient::Comment(id), .. } if id == "c_100")
        );
        assert!(
            matches!(&sent[1], SentMessage::Text { to: Recipient::User(id), .. } if id == "u_100")
        );

        let log = s.store.session_log(session.id).unwrap();
        assert_eq!(log[0], "flow_started");
        assert!(log.contains(&"message_sent".to_string()));
        assert_eq!(log.last().unwrap(), "flow_completed");
    }

    #[tokio::test]
    async fn empty_flow_errors_the_session() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Empty", &TriggerPredicate::default())
            .unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error_message.unwrap().contains("no nodes"));
    }

    #[tokio::test]
    async fn global_loop_guard_stops_a_cycle() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Cycle", &TriggerPredicate::default())
            .unwrap();
        // Six nodes chained into a ring: the global guard fires at 31
        // before any single node reaches its per-node limit.
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(s.store.add_node(flow_id, i, None, &text_node(&["spin"])).unwrap());
        }
        for i in 0..6 {
            s.store.set_node_next(ids[i], Some(ids[(i + 1) % 6])).unwrap();
        }
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("go")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session
            .error_message
            .unwrap()
            .contains("total node executions"));
        assert_eq!(session.state.node_executions, MAX_NODE_EXECUTIONS + 1);
    }

    #[tokio::test]
    async fn per_node_loop_guard_stops_a_self_loop() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "SelfLoop", &TriggerPredicate::default())
            .unwrap();
        let node = s.store.add_node(flow_id, 0, None, &text_node(&["me"])).unwrap();
        s.store.set_node_next(node, Some(node)).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("go")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error_message.unwrap().contains("exceeded 5"));
    }

    #[tokio::test]
    async fn duplicate_quick_reply_send_is_suppressed() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "QR", &TriggerPredicate::default())
            .unwrap();
        let qr = NodeKind::MessageQuickReply {
            texts: vec!["Pick one".into()],
            options: vec![QuickReplyOption {
                title: "Get the link".into(),
                payload: "get_link".into(),
                target_node: None,
            }],
        };
        let node = s.store.add_node(flow_id, 0, None, &qr).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::WaitingReply);

        // Duplicate webhook delivery re-executes the same node.
        let mut fresh = s.store.load_session(session.id).unwrap();
        s.engine.run_from(&flow, &mut fresh, node).await.unwrap();

        assert_eq!(s.gateway.sent_count(), 1);
        assert_eq!(s.store.message_sent_count(session.id, node).unwrap(), 1);
        assert_eq!(fresh.status, SessionStatus::WaitingReply);
    }

    #[tokio::test]
    async fn restricted_send_errors_with_distinct_message() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Promo", &TriggerPredicate::default())
            .unwrap();
        s.store.add_node(flow_id, 0, None, &text_node(&["hello"])).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        s.gateway
            .fail_next(DmFlowError::MessagingRestricted("user has not opted in".into()));
        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.error_message.unwrap().contains("user has not opted in"));
    }

    #[tokio::test]
    async fn branch_target_without_successor_completes() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Branchy", &TriggerPredicate::default())
            .unwrap();
        let target = s.store.add_node(flow_id, 1, None, &text_node(&["leaf"])).unwrap();
        let after = s.store.add_node(flow_id, 2, None, &text_node(&["not reached"])).unwrap();
        let qr = NodeKind::MessageQuickReply {
            texts: vec!["Pick".into()],
            options: vec![QuickReplyOption {
                title: "A".into(),
                payload: "a".into(),
                target_node: Some(target),
            }],
        };
        s.store.add_node(flow_id, 0, None, &qr).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let mut session = s.store.create_session(&flow, &comment("hi")).unwrap();
        s.engine.run_from(&flow, &mut session, target).await.unwrap();

        assert_eq!(session.status, SessionStatus::Completed);
        let sent = s.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], SentMessage::Text { text, .. } if text == "leaf"));
        let _ = after;
    }

    #[tokio::test]
    async fn follower_check_without_consent_never_calls_profile() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Gate", &TriggerPredicate::default())
            .unwrap();
        let yes = s.store.add_node(flow_id, 1, None, &text_node(&["fan!"])).unwrap();
        let no = s.store.add_node(flow_id, 2, None, &text_node(&["follow us"])).unwrap();
        let cond = NodeKind::ConditionFollower {
            true_node: Some(yes),
            false_node: Some(no),
        };
        s.store.add_node(flow_id, 0, None, &cond).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(s.gateway.profile_lookups(), 0);
        assert_eq!(session.status, SessionStatus::Completed);
        // False branch ran.
        assert!(matches!(
            &s.gateway.sent()[0],
            SentMessage::Text { text, .. } if text == "follow us"
        ));
    }

    #[tokio::test]
    async fn follower_check_with_consent_routes_true_branch() {
        let s = setup();
        s.gateway.set_profile(UserProfile {
            name: Some("Jo".into()),
            username: Some("jo".into()),
            follower_count: Some(10),
            is_verified: false,
            is_follower: true,
        });

        let flow_id = s
            .store
            .create_flow(s.account, "Gate", &TriggerPredicate::default())
            .unwrap();
        let yes = s.store.add_node(flow_id, 1, None, &text_node(&["fan!"])).unwrap();
        let cond = NodeKind::ConditionFollower {
            true_node: Some(yes),
            false_node: None,
        };
        let entry = s.store.add_node(flow_id, 0, None, &cond).unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let mut session = s.store.create_session(&flow, &comment("hi")).unwrap();
        s.store
            .log_action(session.id, None, LogAction::QuickReplyReceived, json!({}))
            .unwrap();
        s.engine.run_from(&flow, &mut session, entry).await.unwrap();

        assert_eq!(s.gateway.profile_lookups(), 1);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.variables["is_follower"], json!(true));

        let lead = s.store.load_lead(s.account, "u_100").unwrap().unwrap();
        assert_eq!(lead.is_follower, Some(true));
        assert_eq!(lead.name.as_deref(), Some("Jo"));
    }

    #[tokio::test]
    async fn agent_unavailable_takes_fallback_node() {
        let (store, account) = store_with_account();
        let store = Arc::new(store);
        let gateway = Arc::new(MockGateway::new());
        let agent = Arc::new(MockAgent::unavailable());
        let engine = FlowEngine::new(store.clone(), gateway.clone(), agent);

        let flow_id = store
            .create_flow(account, "AI", &TriggerPredicate::default())
            .unwrap();
        let fallback = store
            .add_node(flow_id, 1, None, &text_node(&["a human will reply"]))
            .unwrap();
        let ai = NodeKind::AiConversation {
            fallback_node: Some(fallback),
        };
        store.add_node(flow_id, 0, None, &ai).unwrap();
        let flow = store.load_flow(flow_id).unwrap();

        let session = engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(matches!(
            &gateway.sent()[0],
            SentMessage::Text { text, .. } if text == "a human will reply"
        ));
    }

    #[tokio::test]
    async fn process_trigger_is_idempotent() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Promo", &TriggerPredicate::default())
            .unwrap();
        s.store.add_node(flow_id, 0, None, &text_node(&["hello"])).unwrap();
        let trigger = s
            .store
            .enqueue_trigger(s.account, flow_id, &comment("hi"))
            .unwrap();

        let first = s.engine.process_trigger(trigger).await.unwrap();
        assert!(matches!(first, TriggerOutcome::Processed { .. }));
        assert_eq!(s.gateway.sent_count(), 1);

        let second = s.engine.process_trigger(trigger).await.unwrap();
        assert_eq!(second, TriggerOutcome::AlreadyHandled);
        assert_eq!(s.gateway.sent_count(), 1);
    }

    #[test]
    fn substitution_skips_null_and_renders_strings() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), json!("Jo"));
        vars.insert("count".to_string(), json!(3));
        vars.insert("is_follower".to_string(), Value::Null);
        assert_eq!(
            substitute("Hi {name}, {count} left {is_follower}", &vars),
            "Hi Jo, 3 left {is_follower}"
        );
    }
}
