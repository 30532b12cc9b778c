//! Pending withdrawal rows.

use super::Repository;
use crate::domain::{
    AccountId, PendingWithdrawal, TimeMs, Tokens, WithdrawalStatus,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

impl Repository {
    /// Record a withdrawal whose amount has just been reserved by a
    /// `withdrawal` settlement.
    pub async fn create_withdrawal(
        &self,
        account_id: AccountId,
        amount: Tokens,
        reference_id: &str,
        ttl_ms: i64,
    ) -> Result<PendingWithdrawal, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = TimeMs::now();
        let expires_at = TimeMs::new(now.as_ms() + ttl_ms);

        sqlx::query(
            r#"
            INSERT INTO pending_withdrawals
            (id, account_id, amount, status, reference_id, created_at, expires_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(account_id.as_i64())
        .bind(amount.as_i64())
        .bind(reference_id)
        .bind(now.as_ms())
        .bind(expires_at.as_ms())
        .execute(self.pool())
        .await?;

        Ok(PendingWithdrawal {
            id,
            account_id,
            amount,
            status: WithdrawalStatus::Pending,
            reference_id: reference_id.to_string(),
            created_at: now,
            expires_at,
            resolved_at: None,
            released_at: None,
        })
    }

    pub async fn get_withdrawal(
        &self,
        id: &str,
    ) -> Result<Option<PendingWithdrawal>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM pending_withdrawals WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|r| withdrawal_from_row(&r)))
    }

    /// Look up a withdrawal by the journal reference of its reservation.
    ///
    /// Lets a retried request find the row created by its first attempt.
    pub async fn get_withdrawal_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<PendingWithdrawal>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM pending_withdrawals WHERE reference_id = ?")
            .bind(reference_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|r| withdrawal_from_row(&r)))
    }

    /// Resolve a pending withdrawal; guarded so only one resolver wins.
    pub async fn resolve_withdrawal(
        &self,
        id: &str,
        status: WithdrawalStatus,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE pending_withdrawals
            SET status = ?, resolved_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(now.as_ms())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the reversal settlement for this withdrawal committed.
    pub async fn mark_withdrawal_released(
        &self,
        id: &str,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE pending_withdrawals SET released_at = ? WHERE id = ? AND released_at IS NULL",
        )
        .bind(now.as_ms())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Rejected or expired withdrawals whose reservation is still sitting
    /// in escrow.
    pub async fn unreleased_withdrawals(&self) -> Result<Vec<PendingWithdrawal>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM pending_withdrawals \
             WHERE status IN ('rejected', 'expired') AND released_at IS NULL \
             ORDER BY resolved_at ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(withdrawal_from_row).collect())
    }

    /// Pending withdrawals whose TTL has passed.
    pub async fn expired_withdrawals(
        &self,
        now: TimeMs,
    ) -> Result<Vec<PendingWithdrawal>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM pending_withdrawals WHERE status = 'pending' AND expires_at <= ? \
             ORDER BY expires_at ASC",
        )
        .bind(now.as_ms())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(withdrawal_from_row).collect())
    }

    /// Withdrawals for one account, newest first.
    pub async fn withdrawals_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<PendingWithdrawal>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM pending_withdrawals WHERE account_id = ? ORDER BY created_at DESC",
        )
        .bind(account_id.as_i64())
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(withdrawal_from_row).collect())
    }
}

fn withdrawal_from_row(row: &SqliteRow) -> PendingWithdrawal {
    let status_str: String = row.get("status");
    let status = WithdrawalStatus::from_str(&status_str).unwrap_or_else(|e| {
        warn!(status = %status_str, error = %e, "Unknown withdrawal status in row, treating as rejected");
        WithdrawalStatus::Rejected
    });

    PendingWithdrawal {
        id: row.get("id"),
        account_id: AccountId::new(row.get("account_id")),
        amount: Tokens::new(row.get("amount")),
        status,
        reference_id: row.get("reference_id"),
        created_at: TimeMs::new(row.get("created_at")),
        expires_at: TimeMs::new(row.get("expires_at")),
        resolved_at: row.get::<Option<i64>, _>("resolved_at").map(TimeMs::new),
        released_at: row.get::<Option<i64>, _>("released_at").map(TimeMs::new),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::setup_test_db;
    use super::*;
    use crate::domain::{AccountKind, OwnerId};

    #[tokio::test]
    async fn test_create_resolve_once() {
        let (repo, _temp) = setup_test_db().await;
        let account = repo
            .get_or_create_account(&OwnerId::new("user-1"), AccountKind::User)
            .await
            .unwrap();

        let withdrawal = repo
            .create_withdrawal(account.id, Tokens::new(100), "ref-1", 1_000)
            .await
            .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::Pending);

        let now = TimeMs::now();
        assert!(repo
            .resolve_withdrawal(&withdrawal.id, WithdrawalStatus::Approved, now)
            .await
            .unwrap());
        assert!(!repo
            .resolve_withdrawal(&withdrawal.id, WithdrawalStatus::Rejected, now)
            .await
            .unwrap());

        let stored = repo.get_withdrawal(&withdrawal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Approved);
    }

    #[tokio::test]
    async fn test_unreleased_scan() {
        let (repo, _temp) = setup_test_db().await;
        let account = repo
            .get_or_create_account(&OwnerId::new("user-1"), AccountKind::User)
            .await
            .unwrap();

        let withdrawal = repo
            .create_withdrawal(account.id, Tokens::new(50), "ref-1", 1_000)
            .await
            .unwrap();

        // Pending rows never show up, only resolved-but-unreleased ones.
        assert!(repo.unreleased_withdrawals().await.unwrap().is_empty());

        let now = TimeMs::now();
        repo.resolve_withdrawal(&withdrawal.id, WithdrawalStatus::Rejected, now)
            .await
            .unwrap();
        let unreleased = repo.unreleased_withdrawals().await.unwrap();
        assert_eq!(unreleased.len(), 1);
        assert_eq!(unreleased[0].id, withdrawal.id);

        repo.mark_withdrawal_released(&withdrawal.id, now)
            .await
            .unwrap();
        assert!(repo.unreleased_withdrawals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_scan() {
        let (repo, _temp) = setup_test_db().await;
        let account = repo
            .get_or_create_account(&OwnerId::new("user-1"), AccountKind::User)
            .await
            .unwrap();

        let stale = repo
            .create_withdrawal(account.id, Tokens::new(10), "ref-1", -1)
            .await
            .unwrap();
        let fresh = repo
            .create_withdrawal(account.id, Tokens::new(20), "ref-2", 3_600_000)
            .await
            .unwrap();

        let expired = repo.expired_withdrawals(TimeMs::now()).await.unwrap();
        let ids: Vec<&str> = expired.iter().map(|w| w.id.as_str()).collect();
        assert!(ids.contains(&stale.id.as_str()));
        assert!(!ids.contains(&fresh.id.as_str()));
    }
}
