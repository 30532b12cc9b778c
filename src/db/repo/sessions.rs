//! Metered session rows: lifecycle transitions and billing advances.
//!
//! Every transition is a guarded UPDATE whose WHERE clause names the state
//! it transitions from, so two racing writers (a billing tick and a manual
//! end, or two overlapping ticks) cannot both win.

use super::Repository;
use crate::domain::{
    AccountId, EndReason, MeteredSession, SessionState, TimeMs, Tokens,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::warn;

impl Repository {
    /// Create a session in state `ringing`.
    pub async fn create_session(
        &self,
        payer: AccountId,
        payee: AccountId,
        rate_per_interval: Tokens,
    ) -> Result<MeteredSession, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = TimeMs::now();

        sqlx::query(
            r#"
            INSERT INTO metered_sessions
            (id, payer_account_id, payee_account_id, rate_per_interval, state, created_at, accumulated_cost)
            VALUES (?, ?, ?, ?, 'ringing', ?, 0)
            "#,
        )
        .bind(&id)
        .bind(payer.as_i64())
        .bind(payee.as_i64())
        .bind(rate_per_interval.as_i64())
        .bind(now.as_ms())
        .execute(self.pool())
        .await?;

        Ok(MeteredSession {
            id,
            payer_account_id: payer,
            payee_account_id: payee,
            rate_per_interval,
            state: SessionState::Ringing,
            end_reason: None,
            created_at: now,
            connected_at: None,
            ended_at: None,
            last_billed_at: None,
            accumulated_cost: Tokens::ZERO,
        })
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<MeteredSession>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM metered_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|r| session_from_row(&r)))
    }

    /// All sessions currently in state `connected` (the billing scan).
    pub async fn connected_sessions(&self) -> Result<Vec<MeteredSession>, sqlx::Error> {
        let rows = sqlx::query("SELECT * FROM metered_sessions WHERE state = 'connected' ORDER BY created_at ASC")
            .fetch_all(self.pool())
            .await?;

        Ok(rows.iter().map(session_from_row).collect())
    }

    /// `ringing → connected`; sets both `connected_at` and the billing
    /// watermark. Returns false if the session was not ringing.
    pub async fn mark_session_connected(
        &self,
        id: &str,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE metered_sessions
            SET state = 'connected', connected_at = ?1, last_billed_at = ?1
            WHERE id = ?2 AND state = 'ringing'
            "#,
        )
        .bind(now.as_ms())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `ringing → declined`. Returns false if the session was not ringing.
    pub async fn mark_session_declined(
        &self,
        id: &str,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE metered_sessions
            SET state = 'declined', end_reason = 'declined', ended_at = ?
            WHERE id = ? AND state = 'ringing'
            "#,
        )
        .bind(now.as_ms())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `connected → ended`. Returns false if the session was not connected
    /// (e.g. a billing tick ended it for lack of funds first).
    pub async fn end_session(
        &self,
        id: &str,
        reason: EndReason,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE metered_sessions
            SET state = 'ended', end_reason = ?, ended_at = ?
            WHERE id = ? AND state = 'connected'
            "#,
        )
        .bind(reason.as_str())
        .bind(now.as_ms())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Read a session row inside an open charge transaction, so billing
    /// decisions are made against current state rather than the scan
    /// snapshot.
    pub(crate) async fn get_session_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: &str,
    ) -> Result<Option<MeteredSession>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM metered_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|r| session_from_row(&r)))
    }

    /// Compare-and-swap advance of the billing watermark, inside the charge
    /// transaction.
    ///
    /// The WHERE clause pins the previous `last_billed_at`, so an
    /// overlapping tick that already advanced the session makes this affect
    /// zero rows; the engine then rolls the whole charge back. The watermark
    /// only ever moves forward.
    pub(crate) async fn advance_session_billing_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: &str,
        expected_last_billed_at: TimeMs,
        new_last_billed_at: TimeMs,
        added_cost: Tokens,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE metered_sessions
            SET last_billed_at = ?1,
                accumulated_cost = accumulated_cost + ?2
            WHERE id = ?3 AND state = 'connected' AND last_billed_at = ?4 AND ?1 > ?4
            "#,
        )
        .bind(new_last_billed_at.as_ms())
        .bind(added_cost.as_i64())
        .bind(id)
        .bind(expected_last_billed_at.as_ms())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `connected → ended/out_of_funds`, inside the charge transaction.
    pub(crate) async fn end_session_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: &str,
        reason: EndReason,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE metered_sessions
            SET state = 'ended', end_reason = ?, ended_at = ?
            WHERE id = ? AND state = 'connected'
            "#,
        )
        .bind(reason.as_str())
        .bind(now.as_ms())
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn session_from_row(row: &SqliteRow) -> MeteredSession {
    let state_str: String = row.get("state");
    let state = SessionState::from_str(&state_str).unwrap_or_else(|e| {
        warn!(state = %state_str, error = %e, "Unknown session state in row, treating as ended");
        SessionState::Ended
    });

    let end_reason = row
        .get::<Option<String>, _>("end_reason")
        .and_then(|s| EndReason::from_str(&s).ok());

    MeteredSession {
        id: row.get("id"),
        payer_account_id: AccountId::new(row.get("payer_account_id")),
        payee_account_id: AccountId::new(row.get("payee_account_id")),
        rate_per_interval: Tokens::new(row.get("rate_per_interval")),
        state,
        end_reason,
        created_at: TimeMs::new(row.get("created_at")),
        connected_at: row.get::<Option<i64>, _>("connected_at").map(TimeMs::new),
        ended_at: row.get::<Option<i64>, _>("ended_at").map(TimeMs::new),
        last_billed_at: row.get::<Option<i64>, _>("last_billed_at").map(TimeMs::new),
        accumulated_cost: Tokens::new(row.get("accumulated_cost")),
    }
}
