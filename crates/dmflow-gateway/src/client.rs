//! Messaging Gateway client for the platform's Graph API.
//!
//! One client per connected account. Consent and permission failures are
//! surfaced as [`DmFlowError::MessagingRestricted`] so the engine can end
//! the session in its distinct consent-denied state; everything else maps
//! to [`DmFlowError::Gateway`].

use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use dmflow_core::config::GatewayConfig;
use dmflow_core::error::{DmFlowError, Result};
use dmflow_core::traits::MessagingGateway;
use dmflow_core::types::{QuickReplyButton, Recipient, TemplateButton, UserProfile};

const MAX_QUICK_REPLIES: usize = 13;
const MAX_TITLE_CHARS: usize = 20;
const MAX_TEMPLATE_TEXT_CHARS: usize = 640;
const MAX_TEMPLATE_BUTTONS: usize = 3;

const PROFILE_FIELDS: &str =
    "name,username,follower_count,is_user_follow_business,is_verified_user";

/// Error codes the platform uses for consent and permission failures.
const RESTRICTED_CODES: [i64; 4] = [10, 200, 230, 190];
const RESTRICTED_TERMS: [&str; 4] = ["follower", "follow", "permission", "blocked"];

#[derive(Debug, Deserialize, Default)]
struct ErrorEnvelope {
    error: Option<GraphError>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: Option<String>,
    code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    name: Option<String>,
    username: Option<String>,
    follower_count: Option<i64>,
    #[serde(default)]
    is_user_follow_business: bool,
    #[serde(default)]
    is_verified_user: bool,
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
    user_id: String,
    access_token: String,
}

impl GraphClient {
    /// Build a client for one connected account. `user_id` is the
    /// account's platform user id, used as the path prefix for sends.
    pub fn new(
        config: &GatewayConfig,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DmFlowError::Gateway(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            access_token: access_token.into(),
        })
    }

    async fn post_message(&self, payload: Value) -> Result<()> {
        let url = format!("{}/{}/messages", self.base_url, self.user_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DmFlowError::Gateway(format!("Network error: {}", e)))?;
        self.consume(response).await.map(|_| ())
    }

    async fn consume(&self, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DmFlowError::Gateway(format!("Network error: {}", e)))?;

        if status.is_success() {
            return serde_json::from_str(&text)
                .map_err(|e| DmFlowError::Gateway(format!("Malformed response body: {}", e)));
        }

        let envelope: ErrorEnvelope = serde_json::from_str(&text).unwrap_or_default();
        let (message, code) = match envelope.error {
            Some(err) => (err.message.unwrap_or_else(|| text.clone()), err.code),
            None => (format!("HTTP {}: {}", status, text), None),
        };
        warn!(status = %status, code, "Gateway call failed: {}", message);
        Err(classify_error(message, code))
    }

    fn recipient_value(to: &Recipient) -> Value {
        match to {
            Recipient::User(id) => json!({"id": id}),
            Recipient::Comment(id) => json!({"comment_id": id}),
        }
    }
}

/// Map a Graph API error onto the engine's taxonomy. Permission/consent
/// failures are recognized by code or by message wording.
fn classify_error(message: String, code: Option<i64>) -> DmFlowError {
    let lower = message.to_lowercase();
    let restricted = code.is_some_and(|c| RESTRICTED_CODES.contains(&c))
        || RESTRICTED_TERMS.iter().any(|term| lower.contains(term));
    if restricted {
        DmFlowError::MessagingRestricted(message)
    } else {
        DmFlowError::Gateway(message)
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn quick_replies_wire(options: &[QuickReplyButton]) -> Vec<Value> {
    options
        .iter()
        .take(MAX_QUICK_REPLIES)
        .map(|opt| {
            json!({
                "content_type": "text",
                "title": truncate_chars(&opt.title, MAX_TITLE_CHARS),
                "payload": opt.payload,
            })
        })
        .collect()
}

fn buttons_wire(buttons: &[TemplateButton]) -> Vec<Value> {
    buttons
        .iter()
        .take(MAX_TEMPLATE_BUTTONS)
        .map(|button| match button {
            TemplateButton::WebUrl { title, url } => json!({
                "type": "web_url",
                "title": truncate_chars(title, MAX_TITLE_CHARS),
                "url": url,
            }),
            TemplateButton::Postback { title, payload } => json!({
                "type": "postback",
                "title": truncate_chars(title, MAX_TITLE_CHARS),
                "payload": payload,
            }),
        })
        .collect()
}

impl MessagingGateway for GraphClient {
    fn reply_to_comment(&self, comment_id: &str, text: &str) -> BoxFuture<'_, Result<()>> {
        let url = format!("{}/{}/replies", self.base_url, comment_id);
        let form = [
            ("message", text.to_string()),
            ("access_token", self.access_token.clone()),
        ];
        Box::pin(async move {
            debug!(url = %url, "Replying to comment");
            let response = self
                .http
                .post(&url)
                .form(&form)
                .send()
                .await
                .map_err(|e| DmFlowError::Gateway(format!("Network error: {}", e)))?;
            self.consume(response).await.map(|_| ())
        })
    }

    fn send_text(&self, to: &Recipient, text: &str) -> BoxFuture<'_, Result<()>> {
        let mut payload = json!({
            "recipient": Self::recipient_value(to),
            "message": {"text": text},
        });
        // RESPONSE typing only applies once the conversation exists.
        if matches!(to, Recipient::User(_)) {
            payload["messaging_type"] = json!("RESPONSE");
        }
        Box::pin(async move { self.post_message(payload).await })
    }

    fn send_quick_replies(
        &self,
        to: &Recipient,
        text: &str,
        options: &[QuickReplyButton],
    ) -> BoxFuture<'_, Result<()>> {
        let mut payload = json!({
            "recipient": Self::recipient_value(to),
            "message": {
                "text": text,
                "quick_replies": quick_replies_wire(options),
            },
        });
        if matches!(to, Recipient::User(_)) {
            payload["messaging_type"] = json!("RESPONSE");
        }
        Box::pin(async move { self.post_message(payload).await })
    }

    fn send_button_template(
        &self,
        to: &Recipient,
        text: &str,
        buttons: &[TemplateButton],
    ) -> BoxFuture<'_, Result<()>> {
        let payload = json!({
            "recipient": Self::recipient_value(to),
            "message": {
                "attachment": {
                    "type": "template",
                    "payload": {
                        "template_type": "button",
                        "text": truncate_chars(text, MAX_TEMPLATE_TEXT_CHARS),
                        "buttons": buttons_wire(buttons),
                    },
                },
            },
        });
        Box::pin(async move { self.post_message(payload).await })
    }

    fn get_profile(&self, igsid: &str) -> BoxFuture<'_, Result<UserProfile>> {
        let url = format!("{}/{}", self.base_url, igsid);
        Box::pin(async move {
            let response = self
                .http
                .get(&url)
                .query(&[
                    ("fields", PROFILE_FIELDS),
                    ("access_token", self.access_token.as_str()),
                ])
                .send()
                .await
                .map_err(|e| DmFlowError::Gateway(format!("Network error: {}", e)))?;
            let body = self.consume(response).await?;
            let profile: ProfileResponse = serde_json::from_value(body)
                .map_err(|e| DmFlowError::Gateway(format!("Malformed profile: {}", e)))?;
            Ok(UserProfile {
                name: profile.name,
                username: profile.username,
                follower_count: profile.follower_count,
                is_verified: profile.is_verified_user,
                is_follower: profile.is_user_follow_business,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_codes_classify_as_restricted() {
        for code in RESTRICTED_CODES {
            assert!(classify_error("opaque".into(), Some(code)).is_messaging_restricted());
        }
        assert!(!classify_error("opaque".into(), Some(1)).is_messaging_restricted());
    }

    #[test]
    fn permission_wording_classifies_as_restricted() {
        assert!(
            classify_error("User must follow the account first".into(), None)
                .is_messaging_restricted()
        );
        assert!(classify_error("You do not have Permission".into(), None)
            .is_messaging_restricted());
        assert!(!classify_error("Rate limit reached".into(), None).is_messaging_restricted());
    }

    #[test]
    fn quick_reply_wire_enforces_limits() {
        let options: Vec<QuickReplyButton> = (0..15)
            .map(|i| QuickReplyButton {
                title: format!("A very long option title number {}", i),
                payload: format!("opt_{}", i),
            })
            .collect();
        let wire = quick_replies_wire(&options);
        assert_eq!(wire.len(), 13);
        assert_eq!(wire[0]["content_type"], "text");
        assert_eq!(wire[0]["title"].as_str().unwrap().chars().count(), 20);
    }

    #[test]
    fn button_wire_caps_at_three() {
        let buttons = vec![
            TemplateButton::WebUrl {
                title: "Shop".into(),
                url: "https://example.com".into(),
            },
            TemplateButton::Postback {
                title: "Deals".into(),
                payload: "deals".into(),
            },
            TemplateButton::Postback {
                title: "Help".into(),
                payload: "help".into(),
            },
            TemplateButton::Postback {
                title: "Extra".into(),
                payload: "extra".into(),
            },
        ];
        let wire = buttons_wire(&buttons);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["type"], "web_url");
        assert_eq!(wire[1]["payload"], "deals");
    }
}
