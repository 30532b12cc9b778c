use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{client_key, principal, require_secret, AppState};
use crate::domain::{PendingWithdrawal, Tokens, WithdrawalStatus};
use crate::error::AppError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalDto {
    pub id: String,
    pub amount: i64,
    pub status: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalListResponse {
    pub withdrawals: Vec<WithdrawalDto>,
}

pub async fn post_withdrawal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<WithdrawalRequest>,
) -> Result<Json<WithdrawalDto>, AppError> {
    let requester = principal(&headers)?;
    let key = client_key(&headers, &requester)?;

    if body.amount <= 0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }

    let withdrawal = state
        .withdrawals
        .request(&requester, Tokens::new(body.amount), key)
        .await?;
    Ok(Json(dto(&withdrawal)))
}

pub async fn get_withdrawals(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WithdrawalListResponse>, AppError> {
    let owner = principal(&headers)?;
    let withdrawals = state.withdrawals.list_for_owner(&owner).await?;
    Ok(Json(WithdrawalListResponse {
        withdrawals: withdrawals.iter().map(dto).collect(),
    }))
}

pub async fn post_approve(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WithdrawalDto>, AppError> {
    resolve(state, headers, &id, WithdrawalStatus::Approved).await
}

pub async fn post_reject(
    Path(id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<WithdrawalDto>, AppError> {
    resolve(state, headers, &id, WithdrawalStatus::Rejected).await
}

async fn resolve(
    state: AppState,
    headers: HeaderMap,
    id: &str,
    status: WithdrawalStatus,
) -> Result<Json<WithdrawalDto>, AppError> {
    require_secret(&headers, "x-admin-secret", &state.config.admin_secret)?;
    let withdrawal = state.withdrawals.resolve(id, status).await?;
    Ok(Json(dto(&withdrawal)))
}

fn dto(withdrawal: &PendingWithdrawal) -> WithdrawalDto {
    WithdrawalDto {
        id: withdrawal.id.clone(),
        amount: withdrawal.amount.as_i64(),
        status: withdrawal.status.as_str().to_string(),
        created_at: withdrawal.created_at.as_ms(),
        expires_at: withdrawal.expires_at.as_ms(),
        resolved_at: withdrawal.resolved_at.map(|t| t.as_ms()),
    }
}
