//! Withdrawal requests: reserve, resolve, expire.
//!
//! A withdrawal request moves the amount out of the user's spendable
//! balance immediately, as a `withdrawal` settlement into the platform
//! escrow account. The pending row then waits for an operator decision:
//! approval leaves the tokens in escrow (they are paid out externally),
//! while rejection or expiry releases the reservation back to the user
//! with a `withdrawal_reversal` settlement.

use crate::db::Repository;
use crate::domain::{
    AccountKind, EntryType, OwnerId, PendingWithdrawal, TimeMs, Tokens, WithdrawalStatus,
};
use crate::notify::Notification;
use crate::settlement::{
    ClientKey, SettleRequest, SettlementEngine, SettlementError, PLATFORM_OWNER,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WithdrawalError {
    #[error("Withdrawal {0} not found")]
    NotFound(String),
    #[error("Withdrawal {id} is already {status}")]
    AlreadyResolved { id: String, status: WithdrawalStatus },
    #[error("A withdrawal cannot be resolved back to pending")]
    InvalidResolution,
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error("Withdrawal operation failed: {0}")]
    Db(#[from] sqlx::Error),
}

pub struct WithdrawalService {
    repo: Arc<Repository>,
    engine: Arc<SettlementEngine>,
    ttl_ms: i64,
}

impl WithdrawalService {
    pub fn new(repo: Arc<Repository>, engine: Arc<SettlementEngine>, ttl_ms: i64) -> Self {
        Self {
            repo,
            engine,
            ttl_ms,
        }
    }

    /// Reserve `amount` from the requester's balance and open a pending
    /// withdrawal. Retrying with the same idempotency key returns the row
    /// opened by the first attempt.
    pub async fn request(
        &self,
        requester: &OwnerId,
        amount: Tokens,
        idempotency_key: ClientKey,
    ) -> Result<PendingWithdrawal, WithdrawalError> {
        let account = self
            .repo
            .get_or_create_account(requester, AccountKind::User)
            .await?;
        let escrow = self
            .repo
            .get_or_create_account(&OwnerId::new(PLATFORM_OWNER), AccountKind::Platform)
            .await?;

        let outcome = self
            .engine
            .settle(SettleRequest {
                entry_type: EntryType::Withdrawal,
                from: Some(account.id),
                to: Some(escrow.id),
                amount,
                reference: None,
                idempotency_key: Some(idempotency_key),
            })
            .await?;

        // The journal reference ties the pending row to its reservation. On
        // a replayed settle the row usually exists already; creating it here
        // also heals a crash between the original commit and the insert.
        if let Some(existing) = self
            .repo
            .get_withdrawal_by_reference(&outcome.journal_ref)
            .await?
        {
            return Ok(existing);
        }

        let withdrawal = self
            .repo
            .create_withdrawal(account.id, amount, &outcome.journal_ref, self.ttl_ms)
            .await?;
        info!(
            withdrawal_id = %withdrawal.id,
            owner = %requester,
            amount = %amount,
            "Withdrawal reserved"
        );
        Ok(withdrawal)
    }

    /// Resolve a pending withdrawal. Exactly one resolver wins the status
    /// transition; rejection and expiry also release the reservation.
    pub async fn resolve(
        &self,
        withdrawal_id: &str,
        status: WithdrawalStatus,
    ) -> Result<PendingWithdrawal, WithdrawalError> {
        if status == WithdrawalStatus::Pending {
            return Err(WithdrawalError::InvalidResolution);
        }

        let withdrawal = self
            .repo
            .get_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(withdrawal_id.to_string()))?;

        if !self
            .repo
            .resolve_withdrawal(withdrawal_id, status, TimeMs::now())
            .await?
        {
            return Err(WithdrawalError::AlreadyResolved {
                id: withdrawal.id,
                status: withdrawal.status,
            });
        }

        // Release after winning the transition, never before: a release
        // racing a concurrent approval would pay the user back while the
        // payout also goes out. If the release fails here the row stays
        // unreleased and the scheduler sweep retries it.
        if status != WithdrawalStatus::Approved {
            self.retry_release(&withdrawal).await?;
        }

        info!(
            withdrawal_id = %withdrawal_id,
            status = %status.as_str(),
            "Withdrawal resolved"
        );
        self.engine
            .notify_best_effort(Notification::WithdrawalResolved {
                withdrawal_id: withdrawal_id.to_string(),
                status: status.as_str().to_string(),
            });

        self.repo
            .get_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(withdrawal_id.to_string()))
    }

    pub async fn get(&self, withdrawal_id: &str) -> Result<PendingWithdrawal, WithdrawalError> {
        self.repo
            .get_withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| WithdrawalError::NotFound(withdrawal_id.to_string()))
    }

    pub async fn list_for_owner(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<PendingWithdrawal>, WithdrawalError> {
        let account = self
            .repo
            .get_or_create_account(owner, AccountKind::User)
            .await?;
        Ok(self.repo.withdrawals_for_account(account.id).await?)
    }

    /// Move the reserved amount out of escrow and back onto the user's
    /// balance, then mark the row released. Keyed by the withdrawal id so
    /// a retry or a concurrent sweep cannot pay twice.
    pub async fn retry_release(
        &self,
        withdrawal: &PendingWithdrawal,
    ) -> Result<(), WithdrawalError> {
        self.release_reservation(withdrawal).await?;
        self.repo
            .mark_withdrawal_released(&withdrawal.id, TimeMs::now())
            .await?;
        Ok(())
    }

    async fn release_reservation(
        &self,
        withdrawal: &PendingWithdrawal,
    ) -> Result<(), WithdrawalError> {
        let escrow = self
            .repo
            .get_or_create_account(&OwnerId::new(PLATFORM_OWNER), AccountKind::Platform)
            .await?;

        self.engine
            .settle(SettleRequest {
                entry_type: EntryType::WithdrawalReversal,
                from: Some(escrow.id),
                to: Some(withdrawal.account_id),
                amount: withdrawal.amount,
                reference: Some(withdrawal.reference_id.clone()),
                idempotency_key: Some(ClientKey {
                    key: format!("wd-release:{}", withdrawal.id),
                    principal: PLATFORM_OWNER.to_string(),
                }),
            })
            .await?;
        Ok(())
    }
}
