//! The call metering scheduler.
//!
//! One tick scans every connected session and bills each elapsed whole
//! interval through the settlement engine. Sessions are independent: each
//! gets its own short transaction, and one session's failure never aborts
//! the rest of the batch. Overlapping ticks are safe because the billing
//! watermark only advances inside a successful charge (a concurrent
//! duplicate sees zero elapsed intervals or loses the compare-and-swap).

use crate::db::Repository;
use crate::domain::{elapsed_intervals, TimeMs, WithdrawalStatus};
use crate::settlement::SettlementEngine;
use crate::withdrawals::WithdrawalService;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Summary of one billing tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub sessions_scanned: usize,
    pub sessions_billed: usize,
    pub sessions_ended: usize,
    pub intervals_billed: i64,
    pub withdrawals_expired: usize,
    /// Reversals retried for rows resolved before their release committed.
    pub withdrawals_released: usize,
    pub errors: Vec<String>,
}

pub struct MeteringScheduler {
    repo: Arc<Repository>,
    engine: Arc<SettlementEngine>,
    withdrawals: Arc<WithdrawalService>,
}

impl MeteringScheduler {
    pub fn new(
        repo: Arc<Repository>,
        engine: Arc<SettlementEngine>,
        withdrawals: Arc<WithdrawalService>,
    ) -> Self {
        Self {
            repo,
            engine,
            withdrawals,
        }
    }

    /// Run one billing tick at `now`.
    pub async fn run_tick(&self, now: TimeMs) -> Result<TickSummary, sqlx::Error> {
        let sessions = self.repo.connected_sessions().await?;
        let mut summary = TickSummary {
            sessions_scanned: sessions.len(),
            ..TickSummary::default()
        };

        for session in sessions {
            let last_billed_at = match session.last_billed_at {
                Some(t) => t,
                None => {
                    // Connected sessions always carry a watermark; skip and
                    // flag rather than guess a start time.
                    summary
                        .errors
                        .push(format!("session {} has no billing watermark", session.id));
                    continue;
                }
            };

            let due = elapsed_intervals(last_billed_at, now, self.engine.interval_ms());
            if due == 0 {
                continue;
            }

            match self.engine.charge_session(&session.id, due, now).await {
                Ok(outcome) => {
                    if outcome.intervals_billed > 0 {
                        summary.sessions_billed += 1;
                        summary.intervals_billed += outcome.intervals_billed;
                    }
                    if outcome.session_ended {
                        summary.sessions_ended += 1;
                    }
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Billing failed for session");
                    summary.errors.push(format!("session {}: {}", session.id, e));
                }
            }
        }

        self.sweep_expired_withdrawals(now, &mut summary).await;

        info!(
            scanned = summary.sessions_scanned,
            billed = summary.sessions_billed,
            ended = summary.sessions_ended,
            intervals = summary.intervals_billed,
            errors = summary.errors.len(),
            "Billing tick complete"
        );
        Ok(summary)
    }

    /// Release reservations whose payout was never approved in time.
    async fn sweep_expired_withdrawals(&self, now: TimeMs, summary: &mut TickSummary) {
        let expired = match self.repo.expired_withdrawals(now).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Expired-withdrawal scan failed");
                summary.errors.push(format!("withdrawal scan: {}", e));
                return;
            }
        };

        for withdrawal in expired {
            match self
                .withdrawals
                .resolve(&withdrawal.id, WithdrawalStatus::Expired)
                .await
            {
                Ok(_) => summary.withdrawals_expired += 1,
                Err(e) => {
                    warn!(withdrawal_id = %withdrawal.id, error = %e, "Withdrawal expiry failed");
                    summary
                        .errors
                        .push(format!("withdrawal {}: {}", withdrawal.id, e));
                }
            }
        }

        // Rows that were rejected or expired but whose reversal never
        // committed still hold the user's tokens in escrow; retry them.
        let unreleased = match self.repo.unreleased_withdrawals().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Unreleased-withdrawal scan failed");
                summary.errors.push(format!("release scan: {}", e));
                return;
            }
        };
        for withdrawal in unreleased {
            match self.withdrawals.retry_release(&withdrawal).await {
                Ok(()) => summary.withdrawals_released += 1,
                Err(e) => {
                    warn!(withdrawal_id = %withdrawal.id, error = %e, "Reversal retry failed");
                    summary
                        .errors
                        .push(format!("withdrawal release {}: {}", withdrawal.id, e));
                }
            }
        }
    }
}
