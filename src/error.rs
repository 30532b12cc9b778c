use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::metering::CallError;
use crate::reconcile::ReconcileError;
use crate::settlement::{AuditError, SettlementError};
use crate::withdrawals::WithdrawalError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Insufficient funds")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<SettlementError> for AppError {
    fn from(err: SettlementError) -> Self {
        match err {
            SettlementError::InsufficientFunds { balance, requested } => {
                AppError::InsufficientFunds {
                    balance: balance.as_i64(),
                    requested: requested.as_i64(),
                }
            }
            SettlementError::AccountFrozen(_) | SettlementError::AccountDisabled(_) => {
                AppError::Forbidden(err.to_string())
            }
            SettlementError::AccountNotFound(_) => AppError::NotFound(err.to_string()),
            SettlementError::InvalidAmount(_)
            | SettlementError::NoAccounts
            | SettlementError::SameAccount => AppError::BadRequest(err.to_string()),
            SettlementError::RequestInFlight => AppError::Conflict(err.to_string()),
            SettlementError::Failed(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::SelfCall | CallError::InvalidRate => AppError::BadRequest(err.to_string()),
            CallError::CoolingDown => AppError::Conflict(err.to_string()),
            CallError::SessionNotFound(_) => AppError::NotFound(err.to_string()),
            CallError::InvalidTransition => AppError::Conflict(err.to_string()),
            CallError::NotCallee | CallError::NotParticipant => {
                AppError::Forbidden(err.to_string())
            }
            CallError::Settlement(e) => e.into(),
            CallError::Db(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<WithdrawalError> for AppError {
    fn from(err: WithdrawalError) -> Self {
        match err {
            WithdrawalError::NotFound(_) => AppError::NotFound(err.to_string()),
            WithdrawalError::AlreadyResolved { .. } => AppError::Conflict(err.to_string()),
            WithdrawalError::InvalidResolution => AppError::BadRequest(err.to_string()),
            WithdrawalError::Settlement(e) => e.into(),
            WithdrawalError::Db(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl From<AuditError> for AppError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::AccountNotFound(_) => AppError::NotFound(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::EventNotFound(_) => AppError::NotFound(err.to_string()),
            ReconcileError::NotReplayable { .. } => AppError::Conflict(err.to_string()),
            ReconcileError::InvalidSnapshot { .. } => AppError::Internal(err.to_string()),
            ReconcileError::Db(e) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::InsufficientFunds { balance, requested } => (
                StatusCode::CONFLICT,
                json!({
                    "error": "Insufficient funds",
                    "balance": balance,
                    "requested": requested,
                }),
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({"error": "Unauthorized"}),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({"error": msg})),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": msg})),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({"error": msg})),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, json!({"error": msg})),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": msg})),
        };

        (status, Json(body)).into_response()
    }
}
