use thiserror::Error;

#[derive(Debug, Error)]
pub enum DmFlowError {
    // Gateway errors
    #[error("Gateway request failed: {0}")]
    Gateway(String),

    #[error("Messaging restricted for recipient: {0}")]
    MessagingRestricted(String),

    // Conversation agent errors
    #[error("Conversation agent error: {0}")]
    Agent(String),

    #[error("Conversation agent unavailable for account {0}")]
    AgentUnavailable(i64),

    // Flow errors
    #[error("Flow {0} not found")]
    FlowNotFound(i64),

    #[error("Flow {0} has no nodes configured")]
    EmptyFlow(i64),

    #[error("Node {node} not found in flow {flow}")]
    NodeNotFound { flow: i64, node: i64 },

    #[error("Session {0} not found")]
    SessionNotFound(i64),

    #[error("Trigger {0} not found")]
    TriggerNotFound(i64),

    // Loop-safety violations
    #[error("Session {session} exceeded {limit} total node executions")]
    InfiniteLoop { session: i64, limit: u32 },

    #[error("Session {session} executed node {node} more than {limit} times")]
    NodeLoop { session: i64, node: i64, limit: u32 },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Webhook payload errors
    #[error("Unparseable response payload: {0}")]
    Payload(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DmFlowError {
    /// Consent/permission failures from the gateway are terminal for a
    /// session and must never be retried automatically.
    pub fn is_messaging_restricted(&self) -> bool {
        matches!(self, Self::MessagingRestricted(_))
    }
}

pub type Result<T> = std::result::Result<T, DmFlowError>;
