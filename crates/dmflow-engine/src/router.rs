//! Inbound webhook routing: comments start or defer sessions, clicks and
//! free-text replies resume suspended ones.

use serde_json::json;
use tracing::{debug, info, warn};

use dmflow_core::config::RateLimitConfig;
use dmflow_core::error::Result;
use dmflow_core::payload::{PayloadKind, ResponsePayload};
use dmflow_core::traits::AgentTurn;
use dmflow_core::types::*;

use crate::engine::FlowEngine;
use crate::validate::{error_prompt, validate, Validation};

/// What `handle_comment` did with an inbound comment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentOutcome {
    /// A session started and ran immediately.
    Started(SessionId),
    /// No rate budget left; a trigger was queued for the worker.
    Queued(TriggerId),
    /// No active flow matched the comment.
    NoMatch,
    /// The comment id was already seen; webhook redeliveries land here.
    Duplicate,
}

impl FlowEngine {
    /// Route a comment-created event. Runs the matching flow immediately
    /// when the account still has rate budget, otherwise defers it to the
    /// trigger queue.
    pub async fn handle_comment(
        &self,
        account: AccountId,
        comment: &CommentEvent,
        limits: &RateLimitConfig,
    ) -> Result<CommentOutcome> {
        if self.store.comment_already_handled(&comment.comment_id)? {
            debug!(comment = %comment.comment_id, "Comment already handled");
            return Ok(CommentOutcome::Duplicate);
        }

        let Some(flow) = self
            .store
            .find_matching_flow(account, &comment.post_id, &comment.text)?
        else {
            debug!(account = %account, comment = %comment.comment_id, "No matching flow");
            return Ok(CommentOutcome::NoMatch);
        };

        let limit = self.store.rate_limit_for(account, limits.default_per_hour)?;
        let used = self.store.calls_last_hour(account)?;
        let budget = i64::from(limit) - i64::from(used) - i64::from(limits.safety_buffer);
        if budget <= 0 {
            let trigger = self.store.enqueue_trigger(account, flow.id, comment)?;
            info!(
                account = %account,
                trigger = %trigger,
                limit,
                used,
                "Rate budget exhausted, trigger queued"
            );
            return Ok(CommentOutcome::Queued(trigger));
        }

        let session = self.trigger_from_comment(&flow, comment).await?;
        Ok(CommentOutcome::Started(session.id))
    }

    /// Route a quick-reply click or button postback. Malformed payloads
    /// are dropped with a warning, never an error.
    pub async fn handle_click(&self, account: AccountId, raw_payload: &str) -> Result<()> {
        let Some(parsed) = ResponsePayload::parse(raw_payload) else {
            warn!(payload = raw_payload, "Unparseable click payload, ignoring");
            return Ok(());
        };

        let mut session = match self.store.load_session(parsed.session) {
            Ok(session) => session,
            Err(e) => {
                warn!(payload = raw_payload, "Click for unknown session: {}", e);
                return Ok(());
            }
        };
        if session.account != account {
            warn!(session = %session.id, "Click payload crossed accounts, ignoring");
            return Ok(());
        }
        if session.status.is_terminal() {
            debug!(session = %session.id, "Click on finished session, ignoring");
            return Ok(());
        }

        let flow = self.store.load_flow(session.flow)?;

        // Any click is the interaction that grants profile-lookup consent.
        self.store.log_action(
            session.id,
            session.current_node,
            LogAction::QuickReplyReceived,
            json!({
                "payload": raw_payload,
                "kind": match parsed.kind {
                    PayloadKind::QuickReply => "quick_reply",
                    PayloadKind::ButtonPostback => "button_postback",
                },
            }),
        )?;
        session.state.consent_granted = true;

        // Fall back to the session's current node when the encoded node id
        // no longer resolves.
        let node = flow
            .node(parsed.node)
            .or_else(|| session.current_node.and_then(|id| flow.node(id)));
        let Some(node) = node else {
            warn!(session = %session.id, "Click node unresolvable, ignoring");
            self.store.update_session(&session)?;
            return Ok(());
        };
        let node = node.clone();

        match parsed.kind {
            PayloadKind::QuickReply => {
                let NodeKind::MessageQuickReply { ref options, .. } = node.kind else {
                    warn!(node = %node.id, "Quick reply payload for non-quick-reply node");
                    self.store.update_session(&session)?;
                    return Ok(());
                };
                let Some(option) = options.iter().find(|o| o.payload == parsed.data) else {
                    warn!(node = %node.id, payload = %parsed.data, "No matching quick reply option");
                    self.store.update_session(&session)?;
                    return Ok(());
                };

                session.status = SessionStatus::Active;
                self.store.update_session(&session)?;
                match option.target_node {
                    Some(target) if flow.node(target).is_some() => {
                        self.run_from(&flow, &mut session, target).await
                    }
                    _ => self.advance_from(&flow, &mut session, &node).await,
                }
            }
            PayloadKind::ButtonPostback => {
                session.state.last_button = Some(parsed.data.clone());
                session.status = SessionStatus::Active;
                self.store.update_session(&session)?;

                let target = match node.kind {
                    NodeKind::MessageButtonTemplate { ref buttons, .. } => buttons
                        .iter()
                        .find(|b| {
                            matches!(b, ButtonSpec::Postback { payload, .. } if *payload == parsed.data)
                        })
                        .and_then(|b| match b {
                            ButtonSpec::Postback { target_node, .. } => *target_node,
                            ButtonSpec::WebUrl { .. } => None,
                        }),
                    _ => None,
                };
                match target {
                    Some(target) if flow.node(target).is_some() => {
                        self.run_from(&flow, &mut session, target).await
                    }
                    _ => self.advance_from(&flow, &mut session, &node).await,
                }
            }
        }
    }

    /// Route a free-text DM. Returns `false` when no open session wanted
    /// it (the message is simply not for us).
    pub async fn handle_text(&self, account: AccountId, igsid: &str, text: &str) -> Result<bool> {
        let Some(mut session) = self.store.find_open_session(account, igsid)? else {
            debug!(account = %account, igsid, "Text reply with no open session");
            return Ok(false);
        };
        let flow = self.store.load_flow(session.flow)?;

        if session.state.ai_conversation {
            self.handle_agent_reply(&flow, &mut session, text).await?;
            return Ok(true);
        }

        let Some(collecting) = session.state.collecting.clone() else {
            debug!(session = %session.id, "Text reply outside data collection, ignoring");
            return Ok(false);
        };
        let Some(node) = flow.node(collecting.node).cloned() else {
            warn!(session = %session.id, node = %collecting.node, "Collecting node missing");
            return Ok(true);
        };

        let (pattern, configured_error) = match node.kind {
            NodeKind::CollectData {
                ref validation,
                ref error_message,
                ..
            } => (validation.as_deref(), error_message.as_deref()),
            _ => (None, None),
        };

        match validate(collecting.field, text, pattern)? {
            Validation::Invalid => {
                // Re-prompt and keep waiting; a failed re-prompt is not
                // worth erroring the session over.
                let prompt = error_prompt(collecting.field, configured_error);
                let result = self
                    .gateway
                    .send_text(&Recipient::User(session.igsid.clone()), &prompt)
                    .await;
                self.store
                    .record_api_call(session.account, "send_text", result.is_ok())?;
                if let Err(e) = result {
                    warn!(session = %session.id, "Validation re-prompt failed: {}", e);
                }
                Ok(true)
            }
            Validation::Valid(value) => {
                session
                    .variables
                    .insert(collecting.variable.clone(), json!(value));
                session.state.collecting = None;
                session.status = SessionStatus::Active;
                self.store.update_session(&session)?;

                let logged_value = if collecting.field == FieldType::Phone {
                    "***"
                } else {
                    value.as_str()
                };
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::DataCollected,
                    json!({
                        "field_type": collecting.field.as_str(),
                        "variable_name": collecting.variable,
                        "value": logged_value,
                    }),
                )?;
                self.store.log_action(
                    session.id,
                    Some(node.id),
                    LogAction::TextReplyReceived,
                    json!({}),
                )?;

                self.update_lead(&session, collecting.field, &collecting.variable, &value)?;
                self.advance_from(&flow, &mut session, &node).await?;
                Ok(true)
            }
        }
    }

    async fn handle_agent_reply(
        &self,
        flow: &FlowDefinition,
        session: &mut FlowSession,
        text: &str,
    ) -> Result<()> {
        let turn = match self.agent.handle_message(session, text).await {
            Ok(turn) => turn,
            Err(e) => AgentTurn::Failed {
                reason: e.to_string(),
            },
        };

        match turn {
            AgentTurn::Continue { reply } => {
                let to = Recipient::User(session.igsid.clone());
                let result = self.gateway.send_text(&to, &reply).await;
                self.store
                    .record_api_call(session.account, "send_text", result.is_ok())?;
                if let Err(e) = result {
                    let node = session.current_node;
                    self.fail_session(session, node, &e.to_string(), "gateway_error")?;
                    return Ok(());
                }
                self.store.log_action(
                    session.id,
                    session.current_node,
                    LogAction::MessageSent,
                    json!({"text": reply, "source": "agent"}),
                )?;
                session.status = SessionStatus::WaitingReply;
                self.store.update_session(session)
            }
            AgentTurn::Complete {
                reply,
                next_node,
                collected,
            } => {
                for (key, value) in collected {
                    session.variables.insert(key, value);
                }
                session.state.ai_conversation = false;

                if let Some(reply) = reply {
                    let to = Recipient::User(session.igsid.clone());
                    let result = self.gateway.send_text(&to, &reply).await;
                    self.store
                        .record_api_call(session.account, "send_text", result.is_ok())?;
                    match result {
                        Ok(()) => self.store.log_action(
                            session.id,
                            session.current_node,
                            LogAction::MessageSent,
                            json!({"text": reply, "source": "agent"}),
                        )?,
                        Err(e) => {
                            warn!(session = %session.id, "Agent closing reply failed: {}", e)
                        }
                    }
                }

                session.status = SessionStatus::Active;
                self.store.update_session(session)?;
                match next_node {
                    Some(id) if flow.node(id).is_some() => {
                        self.run_from(flow, session, id).await
                    }
                    _ => self.complete(session),
                }
            }
            AgentTurn::Failed { reason } => {
                warn!(session = %session.id, "Agent turn failed: {}", reason);
                self.store.log_action(
                    session.id,
                    session.current_node,
                    LogAction::Error,
                    json!({"error": reason, "source": "agent"}),
                )?;
                session.state.ai_conversation = false;
                session.status = SessionStatus::Active;
                self.store.update_session(session)?;

                let ai_node = session.current_node.and_then(|id| flow.node(id)).cloned();
                match ai_node {
                    Some(node) => {
                        let fallback = match node.kind {
                            NodeKind::AiConversation { fallback_node } => fallback_node,
                            _ => None,
                        };
                        match fallback {
                            Some(id) if flow.node(id).is_some() => {
                                self.run_from(flow, session, id).await
                            }
                            _ => self.advance_from(flow, session, &node).await,
                        }
                    }
                    None => self.complete(session),
                }
            }
        }
    }

    fn update_lead(
        &self,
        session: &FlowSession,
        field: FieldType,
        variable: &str,
        value: &str,
    ) -> Result<()> {
        let mut lead = CollectedLead {
            account: session.account,
            igsid: session.igsid.clone(),
            username: session.username.clone(),
            is_follower: session.variables.get("is_follower").and_then(|v| v.as_bool()),
            ..Default::default()
        };
        match field {
            FieldType::Name => lead.name = Some(value.to_string()),
            FieldType::Email => lead.email = Some(value.to_string()),
            FieldType::Phone => lead.phone = Some(value.to_string()),
            FieldType::Custom => {
                lead.custom.insert(variable.to_string(), value.to_string());
            }
        }
        self.store.upsert_lead(&lead)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use dmflow_store::SqliteStore;
    use dmflow_test_utils::{comment, store_with_account, MockAgent, MockGateway, SentMessage};

    struct Setup {
        engine: FlowEngine,
        store: Arc<SqliteStore>,
        gateway: Arc<MockGateway>,
        agent: Arc<MockAgent>,
        account: AccountId,
    }

    fn setup() -> Setup {
        let (store, account) = store_with_account();
        let store = Arc::new(store);
        let gateway = Arc::new(MockGateway::new());
        let agent = Arc::new(MockAgent::new());
        let engine = FlowEngine::new(store.clone(), gateway.clone(), agent.clone());
        Setup {
            engine,
            store,
            gateway,
            agent,
            account,
        }
    }

    fn limits() -> RateLimitConfig {
        RateLimitConfig::default()
    }

    #[tokio::test]
    async fn comment_to_quick_reply_click_end_to_end() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(
                s.account,
                "Link drop",
                &TriggerPredicate {
                    post_id: None,
                    keywords: vec!["help".into()],
                },
            )
            .unwrap();
        let link_node = s
            .store
            .add_node(
                flow_id,
                1,
                None,
                &NodeKind::MessageLink {
                    texts: vec!["Here you go".into()],
                    url: "https://example.com/guide".into(),
                },
            )
            .unwrap();
        let qr_node = s
            .store
            .add_node(
                flow_id,
                0,
                None,
                &NodeKind::MessageQuickReply {
                    texts: vec!["Want the link?".into()],
                    options: vec![QuickReplyOption {
                        title: "Get the link".into(),
                        payload: "get_link".into(),
                        target_node: Some(link_node),
                    }],
                },
            )
            .unwrap();

        let outcome = s
            .engine
            .handle_comment(s.account, &comment("help me out"), &limits())
            .await
            .unwrap();
        let CommentOutcome::Started(session_id) = outcome else {
            panic!("expected a started session, got {:?}", outcome);
        };

        let session = s.store.load_session(session_id).unwrap();
        assert_eq!(session.status, SessionStatus::WaitingReply);
        let log = s.store.session_log(session_id).unwrap();
        assert_eq!(log[0], "flow_started");
        assert!(log.contains(&"message_sent".to_string()));
        assert!(
            matches!(&s.gateway.sent()[0], SentMessage::QuickReplies { to: Recipient::Comment(_), .. })
        );

        // The user clicks the quick reply option.
        let payload = format!("flow_{}_node_{}_opt_get_link", session_id, qr_node);
        s.engine.handle_click(s.account, &payload).await.unwrap();

        let session = s.store.load_session(session_id).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.state.consent_granted);
        let sent = s.gateway.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[1],
            SentMessage::Text { to: Recipient::User(id), text } if id == "u_100" && text.contains("example.com")
        ));

        // No second session appeared.
        assert!(s.store.load_session(SessionId(session_id.0 + 1)).is_err());
    }

    #[tokio::test]
    async fn exhausted_budget_queues_the_trigger() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Promo", &TriggerPredicate::default())
            .unwrap();
        s.store
            .add_node(flow_id, 0, None, &NodeKind::MessageText { texts: vec!["hi".into()] })
            .unwrap();

        // planLimit 200 - used 160 - buffer 50 < 0.
        for _ in 0..160 {
            s.store.record_api_call(s.account, "send_text", true).unwrap();
        }

        let outcome = s
            .engine
            .handle_comment(s.account, &comment("hello"), &limits())
            .await
            .unwrap();
        assert!(matches!(outcome, CommentOutcome::Queued(_)));
        assert_eq!(s.gateway.sent_count(), 0);

        let pending = s
            .store
            .pending_triggers_since(chrono::Utc::now() - chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn unparseable_click_payload_is_ignored() {
        let s = setup();
        s.engine.handle_click(s.account, "garbage").await.unwrap();
        s.engine
            .handle_click(s.account, "flow_1_node_2_whatever")
            .await
            .unwrap();
        assert_eq!(s.gateway.sent_count(), 0);
    }

    #[tokio::test]
    async fn invalid_email_reprompts_then_valid_advances() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Leads", &TriggerPredicate::default())
            .unwrap();
        s.store
            .add_node(
                flow_id,
                0,
                None,
                &NodeKind::CollectData {
                    field: FieldType::Email,
                    prompt: "What's your email?".into(),
                    variable: "email".into(),
                    validation: None,
                    error_message: None,
                },
            )
            .unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::WaitingReply);

        // Invalid: re-prompt, still waiting, nothing stored.
        assert!(s.engine.handle_text(s.account, "u_100", "abc@def").await.unwrap());
        let still = s.store.load_session(session.id).unwrap();
        assert_eq!(still.status, SessionStatus::WaitingReply);
        assert!(!still.variables.contains_key("email"));
        assert!(matches!(
            s.gateway.sent().last().unwrap(),
            SentMessage::Text { text, .. } if text.contains("valid email")
        ));

        // Valid: stored lowercased, lead updated, flow done.
        assert!(s
            .engine
            .handle_text(s.account, "u_100", " ABC@Def.com ")
            .await
            .unwrap());
        let done = s.store.load_session(session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.variables["email"], serde_json::json!("abc@def.com"));
        let lead = s.store.load_lead(s.account, "u_100").unwrap().unwrap();
        assert_eq!(lead.email.as_deref(), Some("abc@def.com"));
        let log = s.store.session_log(session.id).unwrap();
        assert!(log.contains(&"data_collected".to_string()));
    }

    #[tokio::test]
    async fn agent_conversation_continues_then_completes() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "AI", &TriggerPredicate::default())
            .unwrap();
        let closing = s
            .store
            .add_node(
                flow_id,
                1,
                None,
                &NodeKind::MessageText { texts: vec!["thanks, bye".into()] },
            )
            .unwrap();
        s.store
            .add_node(flow_id, 0, None, &NodeKind::AiConversation { fallback_node: None })
            .unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::WaitingReply);
        assert!(session.state.ai_conversation);

        s.agent.push_turn(AgentTurn::Continue {
            reply: "Tell me more".into(),
        });
        assert!(s.engine.handle_text(s.account, "u_100", "I need sizes").await.unwrap());
        let mid = s.store.load_session(session.id).unwrap();
        assert_eq!(mid.status, SessionStatus::WaitingReply);
        assert!(mid.state.ai_conversation);

        let mut collected = std::collections::HashMap::new();
        collected.insert("size".to_string(), serde_json::json!("M"));
        s.agent.push_turn(AgentTurn::Complete {
            reply: Some("Got it!".into()),
            next_node: Some(closing),
            collected,
        });
        assert!(s.engine.handle_text(s.account, "u_100", "medium").await.unwrap());

        let done = s.store.load_session(session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(!done.state.ai_conversation);
        assert_eq!(done.variables["size"], serde_json::json!("M"));
        assert!(matches!(
            s.gateway.sent().last().unwrap(),
            SentMessage::Text { text, .. } if text == "thanks, bye"
        ));
    }

    #[tokio::test]
    async fn button_postback_routes_to_target() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Buttons", &TriggerPredicate::default())
            .unwrap();
        let sale = s
            .store
            .add_node(
                flow_id,
                1,
                None,
                &NodeKind::MessageText { texts: vec!["20% off".into()] },
            )
            .unwrap();
        let btn_node = s
            .store
            .add_node(
                flow_id,
                0,
                None,
                &NodeKind::MessageButtonTemplate {
                    texts: vec!["Choose".into()],
                    buttons: vec![
                        ButtonSpec::WebUrl {
                            title: "Shop".into(),
                            url: "https://example.com".into(),
                        },
                        ButtonSpec::Postback {
                            title: "Deals".into(),
                            payload: "deals".into(),
                            target_node: Some(sale),
                        },
                    ],
                },
            )
            .unwrap();
        let flow = s.store.load_flow(flow_id).unwrap();

        let session = s.engine.trigger_from_comment(&flow, &comment("hi")).await.unwrap();
        assert_eq!(session.status, SessionStatus::WaitingReply);

        let payload = format!("flow_{}_node_{}_btn_deals", session.id, btn_node);
        s.engine.handle_click(s.account, &payload).await.unwrap();

        let done = s.store.load_session(session.id).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.state.last_button.as_deref(), Some("deals"));
        assert!(matches!(
            s.gateway.sent().last().unwrap(),
            SentMessage::Text { text, .. } if text == "20% off"
        ));
    }

    #[tokio::test]
    async fn redelivered_comment_event_is_a_duplicate() {
        let s = setup();
        let flow_id = s
            .store
            .create_flow(s.account, "Promo", &TriggerPredicate::default())
            .unwrap();
        s.store
            .add_node(flow_id, 0, None, &NodeKind::MessageText { texts: vec!["hi".into()] })
            .unwrap();

        let event = comment("hello");
        let first = s.engine.handle_comment(s.account, &event, &limits()).await.unwrap();
        assert!(matches!(first, CommentOutcome::Started(_)));

        let second = s.engine.handle_comment(s.account, &event, &limits()).await.unwrap();
        assert_eq!(second, CommentOutcome::Duplicate);
        assert_eq!(s.gateway.sent_count(), 1);
    }
}
