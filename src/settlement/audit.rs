//! Balance invariant auditing.
//!
//! Every account's stored balance must equal the signed sum of its journal.
//! A mismatch is fatal for the account: it is frozen so no further debits
//! can run, and the discrepancy is surfaced — never silently corrected.

use crate::db::Repository;
use crate::domain::{AccountId, Tokens};
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Account {0} not found")]
    AccountNotFound(AccountId),
    #[error(
        "Balance invariant violated for account {account_id}: stored {stored}, journal {reconstructed}"
    )]
    BalanceInvariantViolation {
        account_id: AccountId,
        stored: Tokens,
        reconstructed: Tokens,
    },
    #[error("Audit failed: {0}")]
    Db(#[from] sqlx::Error),
}

/// Outcome of a clean audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub account_id: AccountId,
    pub balance: Tokens,
    pub entry_count: i64,
}

pub struct Auditor {
    repo: Arc<Repository>,
}

impl Auditor {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Reconstruct an account's balance from the journal and compare it to
    /// the stored value. On mismatch the account is frozen before the error
    /// is returned.
    pub async fn verify_account(&self, account_id: AccountId) -> Result<AuditReport, AuditError> {
        let account = self
            .repo
            .get_account_by_id(account_id)
            .await?
            .ok_or(AuditError::AccountNotFound(account_id))?;

        let reconstructed = self.repo.reconstruct_balance(account_id).await?;
        // A concurrent settlement may have moved both figures between the
        // two reads; re-read the stored balance after summing and accept
        // either snapshot matching.
        let account_after = self
            .repo
            .get_account_by_id(account_id)
            .await?
            .ok_or(AuditError::AccountNotFound(account_id))?;

        if reconstructed != account.balance && reconstructed != account_after.balance {
            error!(
                account_id = %account_id,
                stored = %account_after.balance,
                reconstructed = %reconstructed,
                "Balance invariant violated; freezing account"
            );
            self.repo.freeze_account(account_id).await?;
            return Err(AuditError::BalanceInvariantViolation {
                account_id,
                stored: account_after.balance,
                reconstructed,
            });
        }

        let entry_count = self.repo.entry_count(account_id).await?;
        Ok(AuditReport {
            account_id,
            balance: reconstructed,
            entry_count,
        })
    }
}
