use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{client_key, principal, AppState};
use crate::domain::{EntryType, OwnerId, Tokens};
use crate::error::AppError;
use crate::settlement::TransferOutcome;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub recipient: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub journal_ref: String,
    pub net_amount: i64,
    pub fee_amount: i64,
    pub sender_balance: i64,
}

pub async fn post_tip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, AppError> {
    send(state, headers, body, EntryType::Tip).await
}

pub async fn post_gift(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, AppError> {
    send(state, headers, body, EntryType::Gift).await
}

async fn send(
    state: AppState,
    headers: HeaderMap,
    body: TransferRequest,
    entry_type: EntryType,
) -> Result<Json<TransferResponse>, AppError> {
    let sender = principal(&headers)?;
    let key = client_key(&headers, &sender)?;

    if body.amount <= 0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }

    let outcome = state
        .transfers
        .send(
            entry_type,
            &sender,
            &OwnerId::new(&body.recipient),
            Tokens::new(body.amount),
            key,
        )
        .await?;

    Ok(Json(response_dto(&outcome)))
}

fn response_dto(outcome: &TransferOutcome) -> TransferResponse {
    TransferResponse {
        journal_ref: outcome.journal_ref.clone(),
        net_amount: outcome.net_amount.as_i64(),
        fee_amount: outcome.fee_amount.as_i64(),
        sender_balance: outcome.sender_balance.as_i64(),
    }
}
