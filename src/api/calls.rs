use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{principal, AppState};
use crate::domain::{MeteredSession, OwnerId, Tokens};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub callee: String,
    pub rate_per_interval: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDto {
    pub id: String,
    pub state: String,
    pub rate_per_interval: i64,
    pub accumulated_cost: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

pub async fn post_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CallRequest>,
) -> Result<Json<SessionDto>, AppError> {
    let caller = principal(&headers)?;
    let session = state
        .calls
        .initiate(
            &caller,
            &OwnerId::new(&body.callee),
            Tokens::new(body.rate_per_interval),
        )
        .await?;
    Ok(Json(dto(&session)))
}

pub async fn get_call(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionDto>, AppError> {
    principal(&headers)?;
    let session = state.calls.get(&id).await?;
    Ok(Json(dto(&session)))
}

pub async fn post_accept(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionDto>, AppError> {
    let caller = principal(&headers)?;
    let session = state.calls.accept(&id, &caller).await?;
    Ok(Json(dto(&session)))
}

pub async fn post_decline(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionDto>, AppError> {
    let caller = principal(&headers)?;
    let session = state.calls.decline(&id, &caller).await?;
    Ok(Json(dto(&session)))
}

pub async fn post_end(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionDto>, AppError> {
    let caller = principal(&headers)?;
    let (session, _outcome) = state.calls.end(&id, &caller).await?;
    Ok(Json(dto(&session)))
}

fn dto(session: &MeteredSession) -> SessionDto {
    SessionDto {
        id: session.id.clone(),
        state: session.state.as_str().to_string(),
        rate_per_interval: session.rate_per_interval.as_i64(),
        accumulated_cost: session.accumulated_cost.as_i64(),
        end_reason: session.end_reason.map(|r| r.as_str().to_string()),
        created_at: session.created_at.as_ms(),
        connected_at: session.connected_at.map(|t| t.as_ms()),
        ended_at: session.ended_at.map(|t| t.as_ms()),
    }
}
