use std::sync::Arc;

use dmflow_core::config::AppConfig;
use dmflow_core::error::Result;
use dmflow_core::traits::ConversationAgent;
use dmflow_core::types::AccountId;
use dmflow_engine::FlowEngine;
use dmflow_gateway::GraphClient;
use dmflow_store::SqliteStore;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<SqliteStore>,
    pub agent: Arc<dyn ConversationAgent>,
}

impl AppState {
    /// Build a flow engine bound to one account's Graph API credentials.
    pub fn engine_for(&self, account: AccountId) -> Result<FlowEngine> {
        let (user_id, access_token) = self.store.account_credentials(account)?;
        let gateway = Arc::new(GraphClient::new(&self.config.gateway, user_id, access_token)?);
        Ok(FlowEngine::new(
            self.store.clone(),
            gateway,
            self.agent.clone(),
        ))
    }
}
