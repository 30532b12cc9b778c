use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use crate::api::{require_secret, AppState};
use crate::domain::TimeMs;
use crate::error::AppError;
use crate::metering::TickSummary;

/// Run one billing tick now. Exposed for cron-style external schedulers
/// and for operators; safe to call while the autorun ticker is active
/// because overlapping ticks cannot double-bill.
pub async fn post_run(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TickSummary>, AppError> {
    require_secret(&headers, "x-billing-secret", &state.config.billing_secret)?;

    let summary = state.scheduler.run_tick(TimeMs::now()).await?;
    Ok(Json(summary))
}
