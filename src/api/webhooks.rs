use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use crate::api::{require_secret, AppState};
use crate::domain::ProviderEvent;
use crate::error::AppError;
use crate::reconcile::{signature, ReconcileOutcome};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub event_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Inbound provider event delivery.
///
/// The signature check runs over the raw body, before parsing and before
/// the event id is claimed: an unverifiable delivery is rejected with 401
/// and leaves no record, so the provider retries it. A verified delivery
/// is acknowledged with 200 only once its outcome (processed or failed)
/// is durable.
pub async fn post_provider_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let provided = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;
    if !signature::verify(&state.config.webhook_secret, &body, provided) {
        return Err(AppError::Unauthorized);
    }

    let event: ProviderEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Malformed event payload: {}", e)))?;
    if event.id.is_empty() {
        return Err(AppError::BadRequest("Event id must not be empty".into()));
    }

    let outcome = state.reconciler.process(&event).await?;
    Ok(Json(response(&event.id, &outcome)))
}

/// Manually re-run a failed event from its stored payload snapshot.
pub async fn post_replay(
    Path(event_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WebhookResponse>, AppError> {
    require_secret(&headers, "x-admin-secret", &state.config.admin_secret)?;

    let outcome = state.reconciler.replay(&event_id).await?;
    Ok(Json(response(&event_id, &outcome)))
}

fn response(event_id: &str, outcome: &ReconcileOutcome) -> WebhookResponse {
    match outcome {
        ReconcileOutcome::Processed => WebhookResponse {
            event_id: event_id.to_string(),
            status: "processed".to_string(),
            detail: None,
        },
        ReconcileOutcome::Duplicate { status, detail } => WebhookResponse {
            event_id: event_id.to_string(),
            status: format!("duplicate:{}", status.as_str()),
            detail: detail.clone(),
        },
        ReconcileOutcome::Failed { detail } => WebhookResponse {
            event_id: event_id.to_string(),
            status: "failed".to_string(),
            detail: Some(detail.clone()),
        },
    }
}
