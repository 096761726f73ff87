use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Row id of a flow definition.
    FlowId
);
id_type!(
    /// Row id of a node within a flow.
    NodeId
);
id_type!(
    /// Row id of one flow execution for one end-user.
    SessionId
);
id_type!(
    /// Row id of a connected platform account.
    AccountId
);
id_type!(
    /// Row id of a deferred trigger in the queue.
    TriggerId
);

/// One quick-reply option on a `MessageQuickReply` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReplyOption {
    pub title: String,
    /// Stable identifier encoded into the outbound payload string.
    pub payload: String,
    /// Node to jump to when this option is clicked. `None` advances past
    /// the quick-reply node instead.
    #[serde(default)]
    pub target_node: Option<NodeId>,
}

/// One button on a `MessageButtonTemplate` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ButtonSpec {
    /// Opens a URL in the platform's in-app browser. Never produces a
    /// webhook response.
    WebUrl { title: String, url: String },
    /// Sends a postback webhook carrying `payload` when clicked.
    Postback {
        title: String,
        payload: String,
        #[serde(default)]
        target_node: Option<NodeId>,
    },
}

impl ButtonSpec {
    pub fn title(&self) -> &str {
        match self {
            Self::WebUrl { title, .. } | Self::Postback { title, .. } => title,
        }
    }

    pub fn is_postback(&self) -> bool {
        matches!(self, Self::Postback { .. })
    }
}

/// Which profile field a `CollectData` node gathers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Email,
    Phone,
    Name,
    Custom,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Name => "name",
            Self::Custom => "custom",
        }
    }
}

/// Lookback window for the returning-user condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookbackWindow {
    #[default]
    #[serde(rename = "ever")]
    Ever,
    #[serde(rename = "24h")]
    Hours24,
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
}

impl LookbackWindow {
    /// Earliest completion timestamp that still counts, or `None` for no
    /// lower bound.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Ever => None,
            Self::Hours24 => Some(now - Duration::hours(24)),
            Self::Days7 => Some(now - Duration::days(7)),
            Self::Days30 => Some(now - Duration::days(30)),
        }
    }
}

/// Closed union of node types. Adding a node type is a compile-time
/// concern: every match over `NodeKind` is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Reply publicly to the triggering comment.
    CommentReply {
        #[serde(default)]
        texts: Vec<String>,
    },
    /// Send a plain text DM.
    MessageText {
        #[serde(default)]
        texts: Vec<String>,
    },
    /// Send a text DM containing a URL.
    MessageLink {
        #[serde(default)]
        texts: Vec<String>,
        #[serde(default)]
        url: String,
    },
    /// Send a DM with quick-reply chips and wait for a click.
    MessageQuickReply {
        #[serde(default)]
        texts: Vec<String>,
        #[serde(default)]
        options: Vec<QuickReplyOption>,
    },
    /// Send a DM with a button template (max 3 buttons).
    MessageButtonTemplate {
        #[serde(default)]
        texts: Vec<String>,
        #[serde(default)]
        buttons: Vec<ButtonSpec>,
    },
    /// Branch on whether the end-user follows the account.
    ConditionFollower {
        #[serde(default)]
        true_node: Option<NodeId>,
        #[serde(default)]
        false_node: Option<NodeId>,
    },
    /// Branch on whether this end-user completed another session of the
    /// same flow within the lookback window.
    ConditionUserInteracted {
        #[serde(default)]
        window: LookbackWindow,
        #[serde(default)]
        true_node: Option<NodeId>,
        #[serde(default)]
        false_node: Option<NodeId>,
    },
    /// Prompt for a value, validate the free-text reply, store it.
    CollectData {
        field: FieldType,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        variable: String,
        /// Custom validation regex (only meaningful for `field = custom`).
        #[serde(default)]
        validation: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
    },
    /// Hand the conversation off to the external Conversation Agent.
    AiConversation {
        #[serde(default)]
        fallback_node: Option<NodeId>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CommentReply { .. } => "comment_reply",
            Self::MessageText { .. } => "message_text",
            Self::MessageLink { .. } => "message_link",
            Self::MessageQuickReply { .. } => "message_quick_reply",
            Self::MessageButtonTemplate { .. } => "message_button_template",
            Self::ConditionFollower { .. } => "condition_follower",
            Self::ConditionUserInteracted { .. } => "condition_user_interacted",
            Self::CollectData { .. } => "collect_data",
            Self::AiConversation { .. } => "ai_conversation",
        }
    }
}

/// One step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: NodeId,
    /// Position in the linear fallback order.
    pub order: i64,
    /// Explicit successor; overrides advancing by `order`.
    #[serde(default)]
    pub next_node: Option<NodeId>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Comment-trigger predicate for a flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerPredicate {
    /// Restrict to comments on this post. `None` matches any post.
    #[serde(default)]
    pub post_id: Option<String>,
    /// Case-insensitive substring keywords. Empty matches every comment.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TriggerPredicate {
    pub fn matches(&self, post_id: &str, comment_text: &str) -> bool {
        if let Some(ref wanted) = self.post_id {
            if wanted != post_id {
                return false;
            }
        }
        if self.keywords.is_empty() {
            return true;
        }
        let lower = comment_text.to_lowercase();
        self.keywords
            .iter()
            .any(|kw| lower.contains(&kw.trim().to_lowercase()))
    }
}

/// A server-defined conversation graph, immutable for the duration of one
/// engine entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: FlowId,
    pub account: AccountId,
    pub title: String,
    pub active: bool,
    #[serde(default)]
    pub trigger: TriggerPredicate,
    /// Nodes sorted by ascending `order`.
    pub nodes: Vec<FlowNode>,
}

impl FlowDefinition {
    /// The entry node: lowest `order`.
    pub fn entry_node(&self) -> Option<&FlowNode> {
        self.nodes.iter().min_by_key(|n| n.order)
    }

    pub fn node(&self, id: NodeId) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Next node after `order` in the linear fallback sequence.
    pub fn next_by_order(&self, order: i64) -> Option<&FlowNode> {
        self.nodes
            .iter()
            .filter(|n| n.order > order)
            .min_by_key(|n| n.order)
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    WaitingReply,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WaitingReply => "waiting_reply",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "waiting_reply" => Some(Self::WaitingReply),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Marker for an in-progress data collection, persisted so the next
/// webhook delivery knows which field the free-text reply answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collecting {
    pub node: NodeId,
    pub field: FieldType,
    pub variable: String,
}

/// Typed engine bookkeeping, persisted on the session row. Replaces the
/// convention of underscore-prefixed keys inside the variables map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineState {
    /// Total node executions across the whole session.
    #[serde(default)]
    pub node_executions: u32,
    /// Per-node execution counts, keyed by node id.
    #[serde(default)]
    pub per_node_executions: HashMap<i64, u32>,
    /// Set while a `CollectData` node awaits its reply.
    #[serde(default)]
    pub collecting: Option<Collecting>,
    /// Set once the first inbound click has granted profile-lookup consent.
    #[serde(default)]
    pub consent_granted: bool,
    /// Set while an `AiConversation` node owns the conversation.
    #[serde(default)]
    pub ai_conversation: bool,
    /// Payload of the most recently clicked template button.
    #[serde(default)]
    pub last_button: Option<String>,
}

/// One execution instance of a flow for one end-user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSession {
    pub id: SessionId,
    pub flow: FlowId,
    pub account: AccountId,
    /// Platform-scoped, stable end-user identifier.
    pub igsid: String,
    pub username: String,
    pub trigger_comment_id: Option<String>,
    pub trigger_post_id: Option<String>,
    pub trigger_comment_text: Option<String>,
    pub current_node: Option<NodeId>,
    pub status: SessionStatus,
    pub state: EngineState,
    /// Collected, user-visible variables for `{placeholder}` substitution.
    pub variables: HashMap<String, serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Actions recorded to the append-only execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    FlowStarted,
    NodeExecuted,
    MessageSent,
    CommentReplied,
    QuickReplyReceived,
    ConditionChecked,
    DataCollected,
    TextReplyReceived,
    FlowCompleted,
    Error,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowStarted => "flow_started",
            Self::NodeExecuted => "node_executed",
            Self::MessageSent => "message_sent",
            Self::CommentReplied => "comment_replied",
            Self::QuickReplyReceived => "quick_reply_received",
            Self::ConditionChecked => "condition_checked",
            Self::DataCollected => "data_collected",
            Self::TextReplyReceived => "text_reply_received",
            Self::FlowCompleted => "flow_completed",
            Self::Error => "error",
        }
    }
}

/// Status of a deferred trigger waiting in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A deferred request to run a flow for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTrigger {
    pub id: TriggerId,
    pub account: AccountId,
    pub flow: FlowId,
    pub status: TriggerStatus,
    /// Comment context captured when the trigger was deferred.
    pub comment: CommentEvent,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A comment-created event from the upstream webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub comment_id: String,
    pub post_id: String,
    pub commenter_id: String,
    pub commenter_username: String,
    pub text: String,
}

/// Aggregated per-end-user record of collected answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectedLead {
    pub account: AccountId,
    pub igsid: String,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
    #[serde(default)]
    pub is_follower: Option<bool>,
}

/// Profile data returned by the gateway's consent-gated lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: Option<String>,
    pub username: Option<String>,
    pub follower_count: Option<i64>,
    pub is_verified: bool,
    pub is_follower: bool,
}

/// Outbound message recipient. The first message of a session is addressed
/// by the triggering comment id; everything after by the end-user's IGSID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Comment(String),
    User(String),
}

/// Wire shape of a quick-reply chip handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReplyButton {
    pub title: String,
    pub payload: String,
}

/// Wire shape of a template button handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateButton {
    WebUrl { title: String, url: String },
    Postback { title: String, payload: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_tag_names_round_trip() {
        let node: NodeKind = serde_json::from_str(
            r#"{"type": "message_quick_reply", "texts": ["hi"], "options": []}"#,
        )
        .unwrap();
        assert_eq!(node.name(), "message_quick_reply");

        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "message_quick_reply");
    }

    #[test]
    fn unknown_node_type_is_a_config_error() {
        let res: std::result::Result<NodeKind, _> =
            serde_json::from_str(r#"{"type": "message_carousel"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn trigger_predicate_keyword_matching() {
        let pred = TriggerPredicate {
            post_id: None,
            keywords: vec!["link".into(), "Send".into()],
        };
        assert!(pred.matches("p1", "please SEND it"));
        assert!(pred.matches("p1", "the link pls"));
        assert!(!pred.matches("p1", "nice photo"));

        // Empty keywords match everything.
        let all = TriggerPredicate::default();
        assert!(all.matches("p1", "anything"));
    }

    #[test]
    fn trigger_predicate_post_filter() {
        let pred = TriggerPredicate {
            post_id: Some("post_9".into()),
            keywords: vec![],
        };
        assert!(pred.matches("post_9", "hello"));
        assert!(!pred.matches("post_1", "hello"));
    }

    #[test]
    fn entry_node_is_lowest_order() {
        let flow = FlowDefinition {
            id: FlowId(1),
            account: AccountId(1),
            title: "t".into(),
            active: true,
            trigger: TriggerPredicate::default(),
            nodes: vec![
                FlowNode {
                    id: NodeId(5),
                    order: 2,
                    next_node: None,
                    kind: NodeKind::MessageText { texts: vec![] },
                },
                FlowNode {
                    id: NodeId(3),
                    order: 1,
                    next_node: None,
                    kind: NodeKind::MessageText { texts: vec![] },
                },
            ],
        };
        assert_eq!(flow.entry_node().unwrap().id, NodeId(3));
        assert_eq!(flow.next_by_order(1).unwrap().id, NodeId(5));
        assert!(flow.next_by_order(2).is_none());
    }

    #[test]
    fn lookback_cutoffs() {
        let now = Utc::now();
        assert!(LookbackWindow::Ever.cutoff(now).is_none());
        let day = LookbackWindow::Hours24.cutoff(now).unwrap();
        assert_eq!((now - day).num_hours(), 24);
    }
}
