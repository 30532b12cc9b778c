pub mod accounts;
pub mod billing;
pub mod calls;
pub mod health;
pub mod purchases;
pub mod transfers;
pub mod webhooks;
pub mod withdrawals;

use crate::config::Config;
use crate::db::Repository;
use crate::domain::OwnerId;
use crate::error::AppError;
use crate::metering::{CallService, MeteringScheduler};
use crate::reconcile::Reconciler;
use crate::settlement::{Auditor, ClientKey, SettlementEngine, TransferService};
use crate::withdrawals::WithdrawalService;
use axum::http::HeaderMap;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub config: Config,
    pub engine: Arc<SettlementEngine>,
    pub transfers: Arc<TransferService>,
    pub calls: Arc<CallService>,
    pub withdrawals: Arc<WithdrawalService>,
    pub scheduler: Arc<MeteringScheduler>,
    pub auditor: Arc<Auditor>,
    pub reconciler: Arc<Reconciler>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/v1/accounts/:owner/balance", get(accounts::get_balance))
        .route("/v1/accounts/:owner/ledger", get(accounts::get_ledger))
        .route("/v1/accounts/:owner/audit", post(accounts::post_audit))
        .route("/v1/purchases", post(purchases::post_purchase))
        .route("/v1/tips", post(transfers::post_tip))
        .route("/v1/gifts", post(transfers::post_gift))
        .route(
            "/v1/withdrawals",
            post(withdrawals::post_withdrawal).get(withdrawals::get_withdrawals),
        )
        .route(
            "/v1/withdrawals/:id/approve",
            post(withdrawals::post_approve),
        )
        .route("/v1/withdrawals/:id/reject", post(withdrawals::post_reject))
        .route("/v1/calls", post(calls::post_call))
        .route("/v1/calls/:id", get(calls::get_call))
        .route("/v1/calls/:id/accept", post(calls::post_accept))
        .route("/v1/calls/:id/decline", post(calls::post_decline))
        .route("/v1/calls/:id/end", post(calls::post_end))
        .route("/v1/webhooks/provider", post(webhooks::post_provider_event))
        .route(
            "/v1/webhooks/replay/:event_id",
            post(webhooks::post_replay),
        )
        .route("/v1/billing/run", post(billing::post_run))
        .layer(cors)
        .with_state(state)
}

/// The already-authenticated principal, forwarded by the upstream auth
/// layer.
pub(crate) fn principal(headers: &HeaderMap) -> Result<OwnerId, AppError> {
    headers
        .get("x-principal-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(OwnerId::new)
        .ok_or(AppError::Unauthorized)
}

/// Caller-supplied idempotency key, required on retryable mutation
/// endpoints.
pub(crate) fn client_key(headers: &HeaderMap, principal: &OwnerId) -> Result<ClientKey, AppError> {
    headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|key| ClientKey {
            key: key.to_string(),
            principal: principal.as_str().to_string(),
        })
        .ok_or_else(|| AppError::BadRequest("idempotency-key header is required".into()))
}

pub(crate) fn require_secret(
    headers: &HeaderMap,
    header_name: &str,
    expected: &str,
) -> Result<(), AppError> {
    match headers.get(header_name).and_then(|v| v.to_str().ok()) {
        Some(provided) if provided == expected => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}
