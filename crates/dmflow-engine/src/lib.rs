//! Flow execution engine: graph traversal with loop guards, node
//! handlers, inbound response routing, and collected-data validation.

pub mod agent;
pub mod branch;
pub mod engine;
pub mod router;
pub mod validate;

pub use agent::DisabledAgent;
pub use branch::BranchTargets;
pub use engine::{
    EngineProvider, FlowEngine, TriggerOutcome, DUPLICATE_SEND_WINDOW_SECS, MAX_NODE_EXECUTIONS,
    MAX_PER_NODE_EXECUTIONS,
};
pub use router::CommentOutcome;
