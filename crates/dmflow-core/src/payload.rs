//! Stateless codec for inbound click payloads.
//!
//! Every quick-reply chip and postback button carries a string of the form
//! `flow_{session}_node_{node}_opt_{data}` (or `_btn_` for buttons), so an
//! inbound click can be routed back to its originating session and node
//! without a graph walk or a database lookup.

use crate::types::{NodeId, SessionId};

const PREFIX: &str = "flow_";
const NODE_SEP: &str = "_node_";
const OPT_SEP: &str = "_opt_";
const BTN_SEP: &str = "_btn_";

/// Whether a payload came from a quick-reply chip or a template button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    QuickReply,
    ButtonPostback,
}

/// A decoded click payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    pub session: SessionId,
    pub node: NodeId,
    pub kind: PayloadKind,
    /// The option/button's own payload string.
    pub data: String,
}

impl ResponsePayload {
    pub fn quick_reply(session: SessionId, node: NodeId, data: impl Into<String>) -> Self {
        Self {
            session,
            node,
            kind: PayloadKind::QuickReply,
            data: data.into(),
        }
    }

    pub fn button(session: SessionId, node: NodeId, data: impl Into<String>) -> Self {
        Self {
            session,
            node,
            kind: PayloadKind::ButtonPostback,
            data: data.into(),
        }
    }

    pub fn encode(&self) -> String {
        let sep = match self.kind {
            PayloadKind::QuickReply => OPT_SEP,
            PayloadKind::ButtonPostback => BTN_SEP,
        };
        format!(
            "{}{}{}{}{}{}",
            PREFIX, self.session, NODE_SEP, self.node, sep, self.data
        )
    }

    /// Parse a payload string. Returns `None` on any format deviation —
    /// malformed input must never crash the webhook handler.
    pub fn parse(raw: &str) -> Option<Self> {
        if !raw.starts_with(PREFIX) {
            return None;
        }

        let (sep, kind) = if raw.contains(OPT_SEP) {
            (OPT_SEP, PayloadKind::QuickReply)
        } else if raw.contains(BTN_SEP) {
            (BTN_SEP, PayloadKind::ButtonPostback)
        } else {
            return None;
        };

        let parts: Vec<&str> = raw.split(sep).collect();
        if parts.len() != 2 {
            return None;
        }
        let data = parts[1];
        if data.is_empty() {
            return None;
        }

        // parts[0] is `flow_{session}_node_{node}`.
        let head: Vec<&str> = parts[0].split(NODE_SEP).collect();
        if head.len() != 2 {
            return None;
        }
        let session: i64 = head[0].strip_prefix(PREFIX)?.parse().ok()?;
        let node: i64 = head[1].parse().ok()?;

        Some(Self {
            session: SessionId(session),
            node: NodeId(node),
            kind,
            data: data.to_string(),
        })
    }
}
