//! Typed webhook payload parsing.
//!
//! The platform delivers one envelope per POST, each entry carrying
//! comment changes and/or messaging events. Parsing is separated from
//! the HTTP handlers so the skip rules (echoes, self-comments, reply
//! comments) are testable without a server.

use serde::Deserialize;

use dmflow_core::types::CommentEvent;

#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    #[serde(default)]
    pub entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub messaging: Vec<Messaging>,
}

#[derive(Debug, Deserialize)]
pub struct Change {
    #[serde(default)]
    pub field: String,
    #[serde(default)]
    pub value: CommentValue,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentValue {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: MediaRef,
    #[serde(default)]
    pub from: UserRef,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct Messaging {
    #[serde(default)]
    pub sender: UserRef,
    #[serde(default)]
    pub recipient: UserRef,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub postback: Option<Postback>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub quick_reply: Option<Postback>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Postback {
    #[serde(default)]
    pub payload: String,
}

/// One routable event extracted from an envelope entry.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundEvent {
    Comment {
        entry_id: String,
        comment: CommentEvent,
    },
    Click {
        entry_id: String,
        recipient_id: String,
        payload: String,
    },
    Text {
        entry_id: String,
        recipient_id: String,
        sender_id: String,
        text: String,
    },
}

/// Flatten an envelope into routable events, dropping everything the
/// engine must never see: reply comments, the account's own comments,
/// message echoes, and events with no usable content.
pub fn extract_events(envelope: &WebhookEnvelope) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    for entry in &envelope.entry {
        for change in &entry.changes {
            if change.field != "comments" {
                continue;
            }
            let value = &change.value;
            if value.id.is_empty() {
                continue;
            }
            // Replies to comments never trigger flows.
            if value.parent_id.as_deref().is_some_and(|p| !p.is_empty()) {
                continue;
            }
            // The account commenting on its own post.
            if value.from.id == entry.id {
                continue;
            }
            events.push(InboundEvent::Comment {
                entry_id: entry.id.clone(),
                comment: CommentEvent {
                    comment_id: value.id.clone(),
                    post_id: value.media.id.clone(),
                    commenter_id: value.from.id.clone(),
                    commenter_username: value.from.username.clone(),
                    text: value.text.clone(),
                },
            });
        }

        for messaging in &entry.messaging {
            let sender = &messaging.sender.id;
            if sender.is_empty() || *sender == entry.id || *sender == messaging.recipient.id {
                continue;
            }
            if let Some(ref postback) = messaging.postback {
                if !postback.payload.is_empty() {
                    events.push(InboundEvent::Click {
                        entry_id: entry.id.clone(),
                        recipient_id: messaging.recipient.id.clone(),
                        payload: postback.payload.clone(),
                    });
                }
                continue;
            }
            let Some(ref message) = messaging.message else {
                continue;
            };
            if message.is_echo {
                continue;
            }
            if let Some(ref quick_reply) = message.quick_reply {
                if !quick_reply.payload.is_empty() {
                    events.push(InboundEvent::Click {
                        entry_id: entry.id.clone(),
                        recipient_id: messaging.recipient.id.clone(),
                        payload: quick_reply.payload.clone(),
                    });
                }
                continue;
            }
            if !message.text.is_empty() {
                events.push(InboundEvent::Text {
                    entry_id: entry.id.clone(),
                    recipient_id: messaging.recipient.id.clone(),
                    sender_id: sender.clone(),
                    text: message.text.clone(),
                });
            }
        }
    }

    events
}
