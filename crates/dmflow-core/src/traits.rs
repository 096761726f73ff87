use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Messaging Gateway — the outbound social-platform API, injected so the
/// engine's branching and loop-safety logic is testable without a network.
///
/// Implementations must classify consent/permission failures as
/// [`DmFlowError::MessagingRestricted`](crate::error::DmFlowError) so the
/// engine can end the session in a distinct error state.
pub trait MessagingGateway: Send + Sync + 'static {
    /// Reply publicly to a comment.
    fn reply_to_comment(&self, comment_id: &str, text: &str) -> BoxFuture<'_, Result<()>>;

    /// Send a plain text DM.
    fn send_text(&self, to: &Recipient, text: &str) -> BoxFuture<'_, Result<()>>;

    /// Send a DM with quick-reply chips (max 13, titles truncated to 20).
    fn send_quick_replies(
        &self,
        to: &Recipient,
        text: &str,
        options: &[QuickReplyButton],
    ) -> BoxFuture<'_, Result<()>>;

    /// Send a DM with a button template (text truncated to 640, max 3
    /// buttons).
    fn send_button_template(
        &self,
        to: &Recipient,
        text: &str,
        buttons: &[TemplateButton],
    ) -> BoxFuture<'_, Result<()>>;

    /// Consent-gated profile lookup. Callers must hold prior user
    /// interaction before invoking.
    fn get_profile(&self, igsid: &str) -> BoxFuture<'_, Result<UserProfile>>;
}

/// Outcome of one Conversation Agent turn.
#[derive(Debug, Clone)]
pub enum AgentTurn {
    /// The agent replied and the sub-conversation continues.
    Continue { reply: String },
    /// The agent finished its goal. `next_node` routes the flow onward;
    /// `None` completes the flow. Collected data merges into the session's
    /// variables.
    Complete {
        reply: Option<String>,
        next_node: Option<NodeId>,
        collected: HashMap<String, serde_json::Value>,
    },
    /// The agent failed; the engine falls back to the node's successor.
    Failed { reason: String },
}

/// Conversation Agent — the external language-model hand-off behind the
/// `ai_conversation` node type.
pub trait ConversationAgent: Send + Sync + 'static {
    /// Feature gate. When this returns `false` (or errors) the engine
    /// fails closed and routes past the AI node.
    fn available(&self, account: AccountId) -> BoxFuture<'_, Result<bool>>;

    /// Begin a sub-conversation, returning the agent's opening message.
    /// The engine forwards it through the Messaging Gateway.
    fn start(&self, session: &FlowSession, node: NodeId) -> BoxFuture<'_, Result<String>>;

    /// Feed one end-user message into the running sub-conversation.
    fn handle_message(
        &self,
        session: &FlowSession,
        text: &str,
    ) -> BoxFuture<'_, Result<AgentTurn>>;
}
