//! Ledger journal operations: append within a settlement transaction,
//! paginated history, and full balance reconstruction for audits.

use super::Repository;
use crate::domain::{AccountId, EntryType, LedgerEntry, NewLedgerEntry, TimeMs, Tokens};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use tracing::warn;

impl Repository {
    /// Append the journal rows of one logical transaction.
    ///
    /// All rows land inside the caller's open transaction, in the same unit
    /// of work as the balance mutation that produced them. Rows are never
    /// updated or deleted afterwards.
    pub(crate) async fn append_entries_tx(
        tx: &mut Transaction<'static, Sqlite>,
        entries: &[NewLedgerEntry],
        now: TimeMs,
    ) -> Result<(), sqlx::Error> {
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO ledger_entries
                (account_id, entry_type, signed_amount, balance_after, reference_id, idempotency_key, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.account_id.as_i64())
            .bind(entry.entry_type.as_str())
            .bind(entry.signed_amount)
            .bind(entry.balance_after.as_i64())
            .bind(&entry.reference_id)
            .bind(entry.idempotency_key.as_deref())
            .bind(now.as_ms())
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Journal history for one account, newest first, keyset-paginated.
    pub async fn history(
        &self,
        account_id: AccountId,
        limit: i64,
        before_id: Option<i64>,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, entry_type, signed_amount, balance_after,
                   reference_id, idempotency_key, created_at
            FROM ledger_entries
            WHERE account_id = ? AND id < ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(account_id.as_i64())
        .bind(before_id.unwrap_or(i64::MAX))
        .bind(limit.clamp(1, 500))
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// All journal rows for a reference id (both sides of a transfer).
    pub async fn entries_for_reference(
        &self,
        reference_id: &str,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, entry_type, signed_amount, balance_after,
                   reference_id, idempotency_key, created_at
            FROM ledger_entries
            WHERE reference_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(reference_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Number of journal rows for one account.
    pub async fn entry_count(&self, account_id: AccountId) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM ledger_entries WHERE account_id = ?")
            .bind(account_id.as_i64())
            .fetch_one(self.pool())
            .await?;

        Ok(row.get::<i64, _>("n"))
    }

    /// Recompute an account's balance as the signed sum of its journal.
    ///
    /// Audit path only; never used to authorize spends. Summation happens
    /// over integer columns so SQLite's SUM stays exact here.
    pub async fn reconstruct_balance(
        &self,
        account_id: AccountId,
    ) -> Result<Tokens, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(signed_amount), 0) AS total FROM ledger_entries WHERE account_id = ?",
        )
        .bind(account_id.as_i64())
        .fetch_one(self.pool())
        .await?;

        Ok(Tokens::new(row.get::<i64, _>("total")))
    }
}

fn entry_from_row(row: &SqliteRow) -> LedgerEntry {
    let type_str: String = row.get("entry_type");
    let entry_type = EntryType::from_str(&type_str).unwrap_or_else(|e| {
        warn!(entry_type = %type_str, error = %e, "Unknown entry type in row, treating as transfer");
        EntryType::Transfer
    });

    LedgerEntry {
        id: row.get("id"),
        account_id: AccountId::new(row.get("account_id")),
        entry_type,
        signed_amount: row.get("signed_amount"),
        balance_after: Tokens::new(row.get("balance_after")),
        reference_id: row.get("reference_id"),
        idempotency_key: row.get("idempotency_key"),
        created_at: TimeMs::new(row.get("created_at")),
    }
}
