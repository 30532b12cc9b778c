//! Repository layer for database operations.
//!
//! This module provides the `Repository` struct for all database operations.
//! Methods are organized across submodules by domain:
//! - `journal.rs` - Append-only ledger entries, history, reconstruction
//! - `idempotency.rs` - Provider-event and client-request dedup domains
//! - `sessions.rs` - Metered session rows and billing advances
//! - `withdrawals.rs` - Pending withdrawal rows
//!
//! Mutations that must be atomic with a balance change take a
//! `&mut Transaction` and are committed by the settlement engine; everything
//! else runs on the pool directly.

mod idempotency;
mod journal;
mod sessions;
mod withdrawals;

pub use idempotency::{ClientRequestClaim, ProviderEventClaim};

use crate::domain::{Account, AccountId, AccountKind, OwnerId, TimeMs, Tokens};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::warn;

/// Repository for database operations.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    /// Begin a write transaction for a settlement unit of work.
    ///
    /// SQLite transactions start deferred: the read snapshot is taken at
    /// the first read, and a writer whose snapshot predates a concurrent
    /// commit fails with `SQLITE_BUSY_SNAPSHOT`, which `busy_timeout` does
    /// not cover. Every settlement both reads and writes account rows, so
    /// the no-op write here takes the write lock up front — concurrent
    /// settlements queue on the lock and then read fresh balances.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE accounts SET id = id WHERE 0")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Account operations
    // =========================================================================

    /// Get an account by owner and kind, creating it if absent.
    ///
    /// Accounts are created lazily on first use. The insert-then-select is
    /// race-free: concurrent callers both insert `ON CONFLICT DO NOTHING`
    /// against the `(owner_id, kind)` unique key and read back one row.
    pub async fn get_or_create_account(
        &self,
        owner: &OwnerId,
        kind: AccountKind,
    ) -> Result<Account, sqlx::Error> {
        let now = TimeMs::now();
        sqlx::query(
            r#"
            INSERT INTO accounts (owner_id, kind, balance, total_earned, total_spent, created_at, updated_at)
            VALUES (?, ?, 0, 0, 0, ?, ?)
            ON CONFLICT(owner_id, kind) DO NOTHING
            "#,
        )
        .bind(owner.as_str())
        .bind(kind.as_str())
        .bind(now.as_ms())
        .bind(now.as_ms())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM accounts WHERE owner_id = ? AND kind = ?",
        )
        .bind(owner.as_str())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(account_from_row(&row))
    }

    /// Get an account by owner and kind without creating it.
    pub async fn get_account(
        &self,
        owner: &OwnerId,
        kind: AccountKind,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM accounts WHERE owner_id = ? AND kind = ?")
            .bind(owner.as_str())
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| account_from_row(&r)))
    }

    /// Get an account by row id.
    pub async fn get_account_by_id(
        &self,
        id: AccountId,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| account_from_row(&r)))
    }

    /// Non-locking balance read, for display only.
    ///
    /// Never used to authorize a spend; spends re-check under the settlement
    /// transaction.
    pub async fn read_balance(&self, owner: &OwnerId) -> Result<Option<Tokens>, sqlx::Error> {
        let row = sqlx::query("SELECT balance FROM accounts WHERE owner_id = ? AND kind = 'user'")
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Tokens::new(r.get::<i64, _>("balance"))))
    }

    /// Freeze an account so that further debits are rejected.
    ///
    /// Used by the auditor when the stored balance disagrees with the
    /// journal; the number is never silently corrected.
    pub async fn freeze_account(&self, id: AccountId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET frozen = 1, updated_at = ? WHERE id = ?")
            .bind(TimeMs::now().as_ms())
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Soft-disable an account on closure. Accounts are never hard-deleted.
    pub async fn set_account_disabled(
        &self,
        id: AccountId,
        disabled: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET disabled = ?, updated_at = ? WHERE id = ?")
            .bind(disabled as i64)
            .bind(TimeMs::now().as_ms())
            .bind(id.as_i64())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // In-transaction account operations (settlement engine only)
    // =========================================================================

    /// Read an account row inside an open settlement transaction.
    ///
    /// Callers touching two accounts must call this in ascending-id order so
    /// opposite-direction transfers cannot deadlock.
    pub(crate) async fn lock_account_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: AccountId,
    ) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.as_i64())
            .fetch_optional(&mut **tx)
            .await?;

        Ok(row.map(|r| account_from_row(&r)))
    }

    /// Conditionally debit an account inside an open transaction.
    ///
    /// The balance predicate is re-checked at write time; returns false (and
    /// writes nothing) when the balance no longer covers the amount.
    pub(crate) async fn debit_account_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: AccountId,
        amount: Tokens,
        now: TimeMs,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance - ?1,
                total_spent = total_spent + ?1,
                updated_at = ?2
            WHERE id = ?3 AND balance >= ?1
            "#,
        )
        .bind(amount.as_i64())
        .bind(now.as_ms())
        .bind(id.as_i64())
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Credit an account inside an open transaction.
    pub(crate) async fn credit_account_tx(
        tx: &mut Transaction<'static, Sqlite>,
        id: AccountId,
        amount: Tokens,
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET balance = balance + ?1,
                total_earned = total_earned + ?1,
                updated_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(amount.as_i64())
        .bind(now.as_ms())
        .bind(id.as_i64())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

fn account_from_row(row: &SqliteRow) -> Account {
    let kind_str: String = row.get("kind");
    let kind = AccountKind::from_str(&kind_str).unwrap_or_else(|e| {
        warn!(kind = %kind_str, error = %e, "Unknown account kind in row, treating as user");
        AccountKind::User
    });

    Account {
        id: AccountId::new(row.get("id")),
        owner_id: OwnerId::new(row.get::<String, _>("owner_id")),
        kind,
        balance: Tokens::new(row.get("balance")),
        total_earned: Tokens::new(row.get("total_earned")),
        total_spent: Tokens::new(row.get("total_spent")),
        frozen: row.get::<i64, _>("frozen") != 0,
        disabled: row.get::<i64, _>("disabled") != 0,
        created_at: TimeMs::new(row.get("created_at")),
        updated_at: TimeMs::new(row.get("updated_at")),
    }
}
