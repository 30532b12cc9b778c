use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{client_key, principal, AppState};
use crate::domain::{AccountKind, EntryType, Tokens};
use crate::error::AppError;
use crate::settlement::SettleRequest;

/// Direct token credit, for flows where the client confirms the purchase
/// itself rather than the provider webhook (e.g. a prepaid voucher). The
/// idempotency key makes a timed-out retry safe.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub amount: i64,
    #[serde(default)]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseResponse {
    pub journal_ref: String,
    pub amount: i64,
    pub balance: i64,
}

pub async fn post_purchase(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponse>, AppError> {
    let buyer = principal(&headers)?;
    let key = client_key(&headers, &buyer)?;

    if body.amount <= 0 {
        return Err(AppError::BadRequest("amount must be positive".into()));
    }

    let account = state
        .repo
        .get_or_create_account(&buyer, AccountKind::User)
        .await?;

    let outcome = state
        .engine
        .settle(SettleRequest {
            entry_type: EntryType::Purchase,
            from: None,
            to: Some(account.id),
            amount: Tokens::new(body.amount),
            reference: body.reference,
            idempotency_key: Some(key),
        })
        .await?;

    Ok(Json(PurchaseResponse {
        journal_ref: outcome.journal_ref,
        amount: outcome.amount.as_i64(),
        balance: outcome.to_balance.map(|b| b.as_i64()).unwrap_or_default(),
    }))
}
