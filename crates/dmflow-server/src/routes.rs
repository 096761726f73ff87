use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::{error, info, warn};

use dmflow_core::types::{AccountId, TriggerId};
use dmflow_engine::{CommentOutcome, TriggerOutcome};

use crate::events::{self, InboundEvent, WebhookEnvelope};
use crate::state::AppState;

// GET /api/health — no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// GET /webhook — subscription verification challenge-response.
pub async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let expected = &state.config.server.verify_token;
    if params.mode.as_deref() == Some("subscribe")
        && !expected.is_empty()
        && params.verify_token.as_deref() == Some(expected.as_str())
    {
        info!("Webhook verification succeeded");
        return (StatusCode::OK, params.challenge.unwrap_or_default());
    }
    warn!(mode = ?params.mode, "Webhook verification failed");
    (StatusCode::FORBIDDEN, "Forbidden".to_string())
}

/// POST /webhook — inbound comment and messaging events.
///
/// Always answers 200 once the body parses; per-event failures are
/// logged, never surfaced, so the platform does not redeliver an
/// envelope because one event in it misbehaved.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<WebhookEnvelope>,
) -> Json<serde_json::Value> {
    // Delivery id ties an envelope's log lines together across events.
    let delivery = uuid::Uuid::new_v4();
    for event in events::extract_events(&envelope) {
        if let Err(e) = dispatch_event(&state, &event).await {
            error!(delivery = %delivery, "Webhook event failed: {}", e);
        }
    }
    Json(serde_json::json!({ "status": "ok", "delivery": delivery.to_string() }))
}

async fn dispatch_event(state: &AppState, event: &InboundEvent) -> anyhow::Result<()> {
    match event {
        InboundEvent::Comment { entry_id, comment } => {
            let Some(account) = state.store.account_by_platform_id(entry_id)? else {
                warn!(entry = entry_id, "No account for webhook entry");
                return Ok(());
            };
            let engine = state.engine_for(account)?;
            let outcome = engine
                .handle_comment(account, comment, &state.config.rate_limit)
                .await?;
            match outcome {
                CommentOutcome::Started(session) => {
                    info!(comment = %comment.comment_id, session = %session, "Flow started");
                }
                CommentOutcome::Queued(trigger) => {
                    info!(comment = %comment.comment_id, trigger = %trigger, "Trigger queued");
                }
                CommentOutcome::NoMatch | CommentOutcome::Duplicate => {}
            }
        }
        InboundEvent::Click {
            entry_id,
            recipient_id,
            payload,
        } => {
            let Some(account) = resolve_account(state, entry_id, recipient_id)? else {
                return Ok(());
            };
            state.engine_for(account)?.handle_click(account, payload).await?;
        }
        InboundEvent::Text {
            entry_id,
            recipient_id,
            sender_id,
            text,
        } => {
            let Some(account) = resolve_account(state, entry_id, recipient_id)? else {
                return Ok(());
            };
            state
                .engine_for(account)?
                .handle_text(account, sender_id, text)
                .await?;
        }
    }
    Ok(())
}

/// The entry id usually names the business account; some messaging
/// events only carry it as the recipient.
fn resolve_account(
    state: &AppState,
    entry_id: &str,
    recipient_id: &str,
) -> anyhow::Result<Option<AccountId>> {
    if let Some(account) = state.store.account_by_platform_id(entry_id)? {
        return Ok(Some(account));
    }
    if !recipient_id.is_empty() {
        if let Some(account) = state.store.account_by_platform_id(recipient_id)? {
            return Ok(Some(account));
        }
    }
    warn!(
        entry = entry_id,
        recipient = recipient_id,
        "No account for messaging event"
    );
    Ok(None)
}

/// POST /internal/triggers/{id}/process — run one queued trigger now.
/// Guarded by the internal API key; meant for operator tooling, not the
/// public webhook surface.
pub async fn process_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let expected = &state.config.server.internal_api_key;
    let presented = headers
        .get("x-internal-api-key")
        .and_then(|v| v.to_str().ok());
    if expected.is_empty() || presented != Some(expected.as_str()) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let trigger_id = TriggerId(id);
    let trigger = state
        .store
        .load_trigger(trigger_id)
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let engine = state
        .engine_for(trigger.account)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match engine.process_trigger(trigger_id).await {
        Ok(TriggerOutcome::Processed { session, status }) => Ok(Json(serde_json::json!({
            "status": "processed",
            "session_id": session.0,
            "session_status": status.as_str(),
        }))),
        Ok(TriggerOutcome::AlreadyHandled) => Ok(Json(serde_json::json!({
            "status": "already_handled",
        }))),
        Ok(TriggerOutcome::FlowInactive) => Ok(Json(serde_json::json!({
            "status": "flow_inactive",
        }))),
        Err(e) => {
            error!(trigger = %trigger_id, "Trigger processing failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
