//! Shared test doubles: a recording Messaging Gateway, a scriptable
//! Conversation Agent, and flow fixtures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::traits::{AgentTurn, ConversationAgent, MessagingGateway};
use dmflow_core::types::*;
use dmflow_store::SqliteStore;

/// One outbound call recorded by [`MockGateway`].
#[derive(Debug, Clone)]
pub enum SentMessage {
    CommentReply {
        comment_id: String,
        text: String,
    },
    Text {
        to: Recipient,
        text: String,
    },
    QuickReplies {
        to: Recipient,
        text: String,
        options: Vec<QuickReplyButton>,
    },
    ButtonTemplate {
        to: Recipient,
        text: String,
        buttons: Vec<TemplateButton>,
    },
}

/// An in-memory gateway that records every call and can be scripted to
/// fail the next one.
#[derive(Default)]
pub struct MockGateway {
    sent: Mutex<Vec<SentMessage>>,
    fail_queue: Mutex<VecDeque<DmFlowError>>,
    profile: Mutex<UserProfile>,
    profile_lookups: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: UserProfile) -> Self {
        let gateway = Self::default();
        *gateway.profile.lock().unwrap() = profile;
        gateway
    }

    /// Queue an error; the next gateway call pops and returns it.
    pub fn fail_next(&self, err: DmFlowError) {
        self.fail_queue.lock().unwrap().push_back(err);
    }

    pub fn set_profile(&self, profile: UserProfile) {
        *self.profile.lock().unwrap() = profile;
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// How many times `get_profile` was invoked.
    pub fn profile_lookups(&self) -> usize {
        self.profile_lookups.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<DmFlowError> {
        self.fail_queue.lock().unwrap().pop_front()
    }

    fn record(&self, message: SentMessage) -> Result<()> {
        match self.scripted_failure() {
            Some(err) => Err(err),
            None => {
                self.sent.lock().unwrap().push(message);
                Ok(())
            }
        }
    }
}

impl MessagingGateway for MockGateway {
    fn reply_to_comment(&self, comment_id: &str, text: &str) -> BoxFuture<'_, Result<()>> {
        let message = SentMessage::CommentReply {
            comment_id: comment_id.to_string(),
            text: text.to_string(),
        };
        Box::pin(async move { self.record(message) })
    }

    fn send_text(&self, to: &Recipient, text: &str) -> BoxFuture<'_, Result<()>> {
        let message = SentMessage::Text {
            to: to.clone(),
            text: text.to_string(),
        };
        Box::pin(async move { self.record(message) })
    }

    fn send_quick_replies(
        &self,
        to: &Recipient,
        text: &str,
        options: &[QuickReplyButton],
    ) -> BoxFuture<'_, Result<()>> {
        let message = SentMessage::QuickReplies {
            to: to.clone(),
            text: text.to_string(),
            options: options.to_vec(),
        };
        Box::pin(async move { self.record(message) })
    }

    fn send_button_template(
        &self,
        to: &Recipient,
        text: &str,
        buttons: &[TemplateButton],
    ) -> BoxFuture<'_, Result<()>> {
        let message = SentMessage::ButtonTemplate {
            to: to.clone(),
            text: text.to_string(),
            buttons: buttons.to_vec(),
        };
        Box::pin(async move { self.record(message) })
    }

    fn get_profile(&self, _igsid: &str) -> BoxFuture<'_, Result<UserProfile>> {
        Box::pin(async move {
            self.profile_lookups.fetch_add(1, Ordering::SeqCst);
            match self.scripted_failure() {
                Some(err) => Err(err),
                None => Ok(self.profile.lock().unwrap().clone()),
            }
        })
    }
}

/// A scriptable Conversation Agent. Turns queued with [`push_turn`]
/// (newest last) are consumed one per inbound message.
///
/// [`push_turn`]: MockAgent::push_turn
pub struct MockAgent {
    available: AtomicBool,
    opening: Mutex<String>,
    turns: Mutex<VecDeque<AgentTurn>>,
}

impl Default for MockAgent {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            opening: Mutex::new("Hi! How can I help?".to_string()),
            turns: Mutex::new(VecDeque::new()),
        }
    }
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        let agent = Self::default();
        agent.available.store(false, Ordering::SeqCst);
        agent
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_opening(&self, message: impl Into<String>) {
        *self.opening.lock().unwrap() = message.into();
    }

    pub fn push_turn(&self, turn: AgentTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }
}

impl ConversationAgent for MockAgent {
    fn available(&self, _account: AccountId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move { Ok(self.available.load(Ordering::SeqCst)) })
    }

    fn start(&self, _session: &FlowSession, _node: NodeId) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move { Ok(self.opening.lock().unwrap().clone()) })
    }

    fn handle_message(
        &self,
        _session: &FlowSession,
        _text: &str,
    ) -> BoxFuture<'_, Result<AgentTurn>> {
        Box::pin(async move {
            Ok(self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(AgentTurn::Failed {
                    reason: "no scripted turn".to_string(),
                }))
        })
    }
}

/// A fresh in-memory store with one account.
pub fn store_with_account() -> (SqliteStore, AccountId) {
    let store = SqliteStore::in_memory().expect("in-memory store");
    let account = store
        .create_account("testshop", "ig_test", "test-token")
        .expect("account");
    (store, account)
}

/// A comment event from end-user `u_100` saying `text`.
pub fn comment(text: &str) -> CommentEvent {
    CommentEvent {
        comment_id: "c_100".to_string(),
        post_id: "p_100".to_string(),
        commenter_id: "u_100".to_string(),
        commenter_username: "testuser".to_string(),
        text: text.to_string(),
    }
}
