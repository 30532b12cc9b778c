use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{principal, require_secret, AppState};
use crate::domain::{AccountKind, LedgerEntry, OwnerId};
use crate::error::AppError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub owner_id: String,
    pub balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub frozen: bool,
    pub disabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerQuery {
    pub limit: Option<i64>,
    pub before_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerResponse {
    pub entries: Vec<LedgerEntryDto>,
    /// Pass as `beforeId` to fetch the next page; absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryDto {
    pub id: i64,
    pub entry_type: String,
    pub signed_amount: i64,
    pub balance_after: i64,
    pub reference_id: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub account_id: i64,
    pub balance: i64,
    pub entry_count: i64,
}

pub async fn get_balance(
    Path(owner): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BalanceResponse>, AppError> {
    let owner = require_self(&headers, &owner)?;

    let account = state
        .repo
        .get_account(&owner, AccountKind::User)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No account for {}", owner)))?;

    Ok(Json(BalanceResponse {
        owner_id: account.owner_id.as_str().to_string(),
        balance: account.balance.as_i64(),
        total_earned: account.total_earned.as_i64(),
        total_spent: account.total_spent.as_i64(),
        frozen: account.frozen,
        disabled: account.disabled,
    }))
}

pub async fn get_ledger(
    Path(owner): Path<String>,
    Query(params): Query<LedgerQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LedgerResponse>, AppError> {
    let owner = require_self(&headers, &owner)?;

    let account = state
        .repo
        .get_account(&owner, AccountKind::User)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No account for {}", owner)))?;

    let limit = params.limit.unwrap_or(50);
    let entries = state
        .repo
        .history(account.id, limit, params.before_id)
        .await?;

    let next_before_id = if entries.len() as i64 == limit.clamp(1, 500) {
        entries.last().map(|e| e.id)
    } else {
        None
    };

    Ok(Json(LedgerResponse {
        entries: entries.iter().map(entry_dto).collect(),
        next_before_id,
    }))
}

pub async fn post_audit(
    Path(owner): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AuditResponse>, AppError> {
    require_secret(&headers, "x-admin-secret", &state.config.admin_secret)?;

    let owner = OwnerId::new(&owner);
    let account = state
        .repo
        .get_account(&owner, AccountKind::User)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No account for {}", owner)))?;

    let report = state.auditor.verify_account(account.id).await?;
    Ok(Json(AuditResponse {
        account_id: report.account_id.as_i64(),
        balance: report.balance.as_i64(),
        entry_count: report.entry_count,
    }))
}

/// Balance and ledger are private: the path owner must be the caller.
fn require_self(headers: &HeaderMap, owner: &str) -> Result<OwnerId, AppError> {
    let caller = principal(headers)?;
    if caller.as_str() != owner {
        return Err(AppError::Forbidden(
            "Cannot read another user's account".into(),
        ));
    }
    Ok(caller)
}

fn entry_dto(entry: &LedgerEntry) -> LedgerEntryDto {
    LedgerEntryDto {
        id: entry.id,
        entry_type: entry.entry_type.as_str().to_string(),
        signed_amount: entry.signed_amount,
        balance_after: entry.balance_after.as_i64(),
        reference_id: entry.reference_id.clone(),
        created_at: entry.created_at.as_ms(),
    }
}
