use futures::future::BoxFuture;

use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::traits::{AgentTurn, ConversationAgent};
use dmflow_core::types::{AccountId, FlowSession, NodeId};

/// Conversation agent stub for deployments without an AI backend.
/// Reports unavailable, so `ai_conversation` nodes route straight to
/// their fallback.
pub struct DisabledAgent;

impl ConversationAgent for DisabledAgent {
    fn available(&self, _account: AccountId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async { Ok(false) })
    }

    fn start(&self, _session: &FlowSession, _node: NodeId) -> BoxFuture<'_, Result<String>> {
        Box::pin(async {
            Err(DmFlowError::Config(
                "conversation agent is not configured".to_string(),
            ))
        })
    }

    fn handle_message(
        &self,
        _session: &FlowSession,
        _text: &str,
    ) -> BoxFuture<'_, Result<AgentTurn>> {
        Box::pin(async {
            Ok(AgentTurn::Failed {
                reason: "conversation agent is not configured".to_string(),
            })
        })
    }
}
